//! Assert-or-degrade contract checks
//!
//! Programming-contract violations (unlock by a non-owner, blocking from an
//! interrupt handler, readying an already-ready thread) go through this
//! single check point. Checked builds (`contract-abort` feature) halt with
//! diagnostic context; production builds return the corresponding error code
//! with all kernel invariants intact. Both behaviors derive from this one
//! function, never from duplicated call sites.

use crate::error::{Errno, Result};

/// Report a contract violation on `object` during `operation`.
///
/// Returns `Err(errno)` in production builds; panics in checked builds.
pub(crate) fn violation<T>(object: &str, operation: &str, errno: Errno) -> Result<T> {
    log::error!("contract violation: {} on '{}': {}", operation, object, errno);
    if cfg!(feature = "contract-abort") {
        panic!(
            "kernel contract violation: {} on '{}' ({})",
            operation, object, errno
        );
    }
    Err(errno)
}

#[cfg(all(test, not(feature = "contract-abort")))]
mod tests {
    use super::*;

    #[test]
    fn production_builds_degrade_to_error() {
        let r: Result<()> = violation("m0", "unlock", Errno::NotPermitted);
        assert_eq!(r, Err(Errno::NotPermitted));
    }
}
