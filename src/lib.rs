pub mod config;
pub mod error;
pub mod eviction;
pub mod ledger;
pub mod manifest;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod worker;

pub use config::CoreConfig;
pub use error::{CoordError, Result, StateKind};
pub use eviction::{EvictionManager, EvictionReport};
pub use ledger::{ResultRecord, ResultsLedger};
pub use manifest::{Entry, EntryId, EntryPatch, ManifestRepository, ProcessingStatus, StatusGuard};
pub use status::{ServiceRegistry, ServiceState, ServiceStatus};
pub use supervisor::{SupervisorCycle, SupervisorReport};
pub use sync::{DirectoryRemote, RemoteStore, SyncAgent, SyncReport, SyncTransfer};
pub use worker::{ShutdownController, StopSignal, UnitOutcome, WorkUnit, Worker, WorkerPhase};

/// Initialise `env_logger` the way every binary here does: `RUST_LOG`, default `info`, stderr.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}
