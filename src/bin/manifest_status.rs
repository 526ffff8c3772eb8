//! Manifest Status - one-shot, read-only summary for operators
//!
//! Usage:
//!   cargo run --bin manifest_status

use capture_coord::CoreConfig;
use dotenv::dotenv;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    capture_coord::init_logging();

    let config = CoreConfig::from_env();
    let summary = config.manifest().summary()?;

    println!("📊 Manifest: {}", config.manifest_path().display());
    println!("   ├─ Entries: {}", summary.total);
    for (status, count) in &summary.by_status {
        println!("   ├─ {}: {}", status, count);
    }
    println!("   ├─ Synced: {}", summary.synced);
    println!("   ├─ With local artifact: {}", summary.with_local_path);
    println!("   └─ Processing errors: {}", summary.processing_errors);

    let services = config.services().all()?;
    if !services.is_empty() {
        println!("🩺 Services: {}", config.status_path().display());
        for (name, status) in &services {
            let heartbeat = status
                .last_heartbeat
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!("   ├─ {}: {:?} (pid {:?}, heartbeat {})", name, status.state, status.pid, heartbeat);
        }
    }
    Ok(())
}
