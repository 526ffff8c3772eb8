//! Sync Agent - local-first replication to the remote store
//!
//! Copies every processed, unsynced artifact to the remote directory, marks it
//! synced in the manifest, and mirrors manifest/ledger snapshots alongside.
//! A failed transfer ends the pass; the entry is retried with backoff.
//!
//! Usage:
//!   cargo run --release --bin sync_agent
//!
//! Environment variables:
//!   COORD_SYNC_ENABLED - Master switch (default: false)
//!   COORD_REMOTE_DIR - Mounted remote directory (required when enabled)
//!   COORD_SYNC_REMOVE_LOCAL - Delete local copies after sync (default: false)
//!   COORD_POLL_INTERVAL_MS - Idle poll interval (default: 2000)

use std::sync::Arc;

use capture_coord::{CoreConfig, DirectoryRemote, ShutdownController, SyncAgent, Worker};
use dotenv::dotenv;
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    capture_coord::init_logging();

    info!("🚀 Sync Agent");

    let config = CoreConfig::from_env();
    config.validate()?;

    if !config.sync_enabled {
        info!("⚠️  Sync is DISABLED (set COORD_SYNC_ENABLED=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }
    let Some(remote_dir) = config.remote_dir.clone() else {
        return Err("COORD_REMOTE_DIR is not set".into());
    };

    let remote = Arc::new(DirectoryRemote::new(remote_dir));
    info!("✅ Sync ENABLED");
    info!("   ├─ Manifest: {}", config.manifest_path().display());
    info!("   ├─ Ledger: {}", config.results_path().display());
    info!("   ├─ Remote: {}", remote.root().display());
    info!("   ├─ Transfer: {:?}", config.sync_transfer());
    info!("   └─ Poll interval: {}ms", config.poll_interval_ms);

    let agent = SyncAgent::new(config.manifest(), remote)
        .with_ledger(config.ledger())
        .with_transfer(config.sync_transfer());

    let shutdown = ShutdownController::new();
    shutdown.listen_for_signals()?;

    let worker = Worker::new(agent, shutdown.signal(), config.poll_interval())
        .with_status(config.services());

    match worker.run().await {
        Ok(exit) => {
            info!("✅ Sync Agent stopped ({} passes, {} artifacts synced)", exit.units, exit.items);
            Ok(())
        }
        Err(e) => {
            error!("❌ Sync Agent failed: {}", e);
            Err(e.into())
        }
    }
}
