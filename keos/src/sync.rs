//! Synchronization primitives.
//!
//! KeOS spinlocks do not release themselves on drop: every critical section
//! ends with an explicit `unlock()`.
pub use abyss::spinlock::{SpinLock, SpinLockGuard};
