//! # Worker lifecycle
//!
//! Every worker role is one process running one [`Worker`] loop over a
//! [`WorkUnit`]. The loop is sequential; all concurrency is between processes
//! and is arbitrated by the lock-protected files.
//!
//! ## Module Organization
//!
//! - `shutdown` - stop flag, signal handling, interruptible idle sleep
//! - `runner` - the `RUNNING -> STOPPING -> STOPPED` loop
//! - `backoff` - capped exponential backoff for transient failures
//! - `analysis` - the claim/work/recommit unit used by analysis workers

pub mod analysis;
pub mod backoff;
pub mod runner;
pub mod shutdown;

pub use analysis::{AnalysisCycle, Analyzer, AnalyzerError, StalePolicy};
pub use backoff::ExponentialBackoff;
pub use runner::{UnitOutcome, WorkUnit, Worker, WorkerExit};
pub use shutdown::{ShutdownController, StopSignal, WorkerPhase};
