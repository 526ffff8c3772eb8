//! Lock-protected access to shared state files.
//!
//! - `lock` - advisory flock on a sibling `.lock` file, released by the kernel
//!   when the holder exits
//! - `locked_store` - typed read / atomic write of a JSON document under that lock

pub mod lock;
pub mod locked_store;

pub use lock::{acquire, lock_path_for, LockGuard};
pub use locked_store::{Locked, LockedStore};
