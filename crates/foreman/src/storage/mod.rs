//! Filesystem persistence: the locking primitive and the atomic task store
//! built on top of it.

pub mod lock;
pub mod store;

pub use lock::{FileLocker, LockGuard};
pub use store::TaskStore;
