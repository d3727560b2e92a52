//! Concurrent state sets (C2) and the per-path pessimistic lock manager (C4).
//!
//! Both live in one crate because both are small, both are pure in-memory
//! coordination structures shared between the FUSE callback threads and the
//! daemon's async side, and both follow the same "`Mutex`-guarded map plus
//! `Notify` for waiters" shape.

pub mod lock;
pub mod sets;

pub use lock::{Direction, LockManager, WaitResult};
pub use sets::{BoundedSet, StateSets};

#[cfg(test)]
mod tests {
    // Per-submodule tests live in `sets.rs` and `lock.rs`; this module
    // exists so `cargo test -p overlayfs-state` has a home even before
    // those are added to -- a thin re-export layer at the crate root.
}
