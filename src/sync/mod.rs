//! Remote synchronization: the [`SyncAgent`] and the [`RemoteStore`] it writes to.

pub mod agent;
pub mod remote;

pub use agent::{remote_name, SyncAgent, SyncFailure, SyncReport, SyncTransfer, LEDGER_ARCHIVE_DIR, SNAPSHOT_DIR};
pub use remote::{DirectoryRemote, RemoteStore};
