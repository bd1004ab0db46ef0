//! Reusable kernel data structures

pub mod arena;
pub mod list;

pub use arena::{Arena, Handle};
pub use list::{Adapter, Link, List};
