//! Manifest Supervisor - periodic health sweep over shared state
//!
//! Logs `processing` claims that have been held too long and services whose
//! heartbeat stopped. With COORD_BUFFER_SIZE > 0 it also reconciles the local
//! artifact ring buffer every sweep.
//!
//! Usage:
//!   cargo run --release --bin manifest_supervisor
//!
//! Environment variables:
//!   SUPERVISOR_CLAIM_AGE_SECS - Report claims older than this (default: 600)
//!   SUPERVISOR_HEARTBEAT_AGE_SECS - Report services quiet for longer (default: 120)
//!   SUPERVISOR_INTERVAL_MS - Sweep interval (default: 30000)

use std::env;
use std::time::Duration;

use capture_coord::{CoreConfig, ShutdownController, SupervisorCycle, Worker};
use dotenv::dotenv;
use log::{error, info};

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    capture_coord::init_logging();

    info!("🚀 Manifest Supervisor");

    let config = CoreConfig::from_env();
    config.validate()?;

    let claim_age = env_secs("SUPERVISOR_CLAIM_AGE_SECS", 600);
    let heartbeat_age = env_secs("SUPERVISOR_HEARTBEAT_AGE_SECS", 120);
    let interval = Duration::from_millis(
        env::var("SUPERVISOR_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000),
    );

    info!("   ├─ Manifest: {}", config.manifest_path().display());
    info!("   ├─ Status file: {}", config.status_path().display());
    info!("   ├─ Claim age: {:?}", claim_age);
    info!("   ├─ Heartbeat age: {:?}", heartbeat_age);
    info!("   └─ Eviction buffer: {}", config.buffer_size);

    let mut cycle = SupervisorCycle::new(config.manifest(), config.services(), claim_age, heartbeat_age);
    if config.buffer_size > 0 {
        cycle = cycle.with_eviction(config.eviction());
    }

    let shutdown = ShutdownController::new();
    shutdown.listen_for_signals()?;

    let worker = Worker::new(cycle, shutdown.signal(), interval).with_status(config.services());
    if let Err(e) = worker.run().await {
        error!("❌ Supervisor failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
