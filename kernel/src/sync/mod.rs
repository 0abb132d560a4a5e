//! Synchronization primitives used by the memory core.

pub mod once_lock;
pub mod spinlock;

pub use once_lock::OnceLock;
pub use spinlock::SpinLock;
