//! Property-based invariants over the kernel object APIs.

use proptest::collection::vec;
use proptest::prelude::*;

use kairos::{Errno, Kernel};

proptest! {
    /// The semaphore counter tracks a plain integer mirror and never
    /// leaves the [0, max] range, whatever the op sequence.
    #[test]
    fn semaphore_counter_matches_a_model(
        max in 1i32..16,
        initial_frac in 0u32..100,
        ops in vec(any::<bool>(), 0..64),
    ) {
        let initial = (i64::from(initial_frac) * i64::from(max) / 100) as i32;
        let k = Kernel::new();
        let s = k.sem_create("s", initial, max).unwrap();
        let mut model = initial;

        for post in ops {
            if post {
                match k.sem_post(s) {
                    Ok(()) => model += 1,
                    Err(Errno::Overflow) => prop_assert_eq!(model, max),
                    Err(e) => prop_assert!(false, "post: {:?}", e),
                }
            } else {
                match k.sem_try_wait(s) {
                    Ok(()) => model -= 1,
                    Err(Errno::Busy) => prop_assert_eq!(model, 0),
                    Err(e) => prop_assert!(false, "wait: {:?}", e),
                }
            }
            let count = k.sem_value(s).unwrap();
            prop_assert_eq!(count, model);
            prop_assert!((0..=max).contains(&count));
        }
    }

    /// Draining a queue yields priorities in nonincreasing order, and
    /// arrival order within each priority band.
    #[test]
    fn queue_drain_is_a_stable_priority_sort(
        msgs in vec(0u8..4, 0..32),
    ) {
        let k = Kernel::new();
        let q = k.mq_create("q", 32, 1).unwrap();
        for (i, &prio) in msgs.iter().enumerate() {
            k.mq_try_send(q, &[i as u8], prio).unwrap();
        }

        let mut expected: Vec<(u8, usize)> =
            msgs.iter().enumerate().map(|(i, &p)| (p, i)).collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0));

        let mut last_prio = u8::MAX;
        for &(prio, idx) in &expected {
            let got = k.mq_try_recv(q).unwrap();
            prop_assert!(got.priority <= last_prio);
            last_prio = got.priority;
            prop_assert_eq!(got.priority, prio);
            prop_assert_eq!(&*got.data, &[idx as u8]);
        }
        prop_assert_eq!(k.mq_try_recv(q), Err(Errno::Busy));
    }

    /// Handles to deleted objects stay dead even after their slots are
    /// reused by later creations.
    #[test]
    fn stale_handles_never_resolve(rounds in 1usize..8, per_round in 1usize..8) {
        let k = Kernel::new();
        let mut dead = Vec::new();
        for _ in 0..rounds {
            let live: Vec<_> = (0..per_round).map(|_| k.flags_create("f", 0)).collect();
            for &f in &live {
                prop_assert_eq!(k.flags_get(f), Ok(0));
            }
            for &stale in &dead {
                prop_assert_eq!(k.flags_get(stale), Err(Errno::InvalidArgument));
            }
            for f in live {
                k.flags_delete(f).unwrap();
                dead.push(f);
            }
        }
        for stale in dead {
            prop_assert_eq!(k.flags_get(stale), Err(Errno::InvalidArgument));
        }
    }
}
