//! Periodic read-mostly sweep for operators.
//!
//! Reports `processing` claims older than a threshold and services whose
//! heartbeat went quiet. It never re-queues anything itself; reclaiming is the
//! analysis workers' job. Optionally runs an eviction pass each sweep, for
//! deployments where capture does not reconcile the ring buffer itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::eviction::EvictionManager;
use crate::manifest::{EntryId, ManifestRepository};
use crate::status::ServiceRegistry;
use crate::worker::{UnitOutcome, WorkUnit};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorReport {
    pub stale_claims: Vec<EntryId>,
    pub stale_services: Vec<String>,
    pub evicted: usize,
}

pub struct SupervisorCycle {
    repo: ManifestRepository,
    services: ServiceRegistry,
    claim_age: Duration,
    heartbeat_age: Duration,
    eviction: Option<EvictionManager>,
}

impl SupervisorCycle {
    pub fn new(
        repo: ManifestRepository,
        services: ServiceRegistry,
        claim_age: Duration,
        heartbeat_age: Duration,
    ) -> Self {
        Self {
            repo,
            services,
            claim_age,
            heartbeat_age,
            eviction: None,
        }
    }

    pub fn with_eviction(mut self, eviction: EvictionManager) -> Self {
        self.eviction = Some(eviction);
        self
    }

    pub fn sweep(&self) -> Result<SupervisorReport> {
        let now = Utc::now();
        let mut report = SupervisorReport::default();

        for entry in self.repo.query_stale(self.claim_age, now)? {
            log::warn!(
                "⚠️  Entry {} processing since {} ({} claim attempts)",
                entry.id,
                entry
                    .claimed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string()),
                entry.claim_attempts
            );
            report.stale_claims.push(entry.id);
        }

        for (name, status) in self.services.stale_services(self.heartbeat_age, now)? {
            log::warn!(
                "⚠️  Service {} (pid {:?}) has not reported since {:?}",
                name,
                status.pid,
                status.last_heartbeat
            );
            report.stale_services.push(name);
        }

        if let Some(eviction) = &self.eviction {
            report.evicted = eviction.run_pass()?.deleted.len();
        }

        Ok(report)
    }
}

#[async_trait]
impl WorkUnit for SupervisorCycle {
    fn name(&self) -> &str {
        "manifest-supervisor"
    }

    /// One sweep per poll interval; a sweep is never "work" that skips the sleep.
    async fn run_once(&mut self) -> Result<UnitOutcome> {
        let report = self.sweep()?;
        log::info!(
            "📊 Sweep: {} stale claims, {} quiet services, {} evicted",
            report.stale_claims.len(),
            report.stale_services.len(),
            report.evicted
        );
        Ok(UnitOutcome::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Entry, ProcessingStatus};

    #[test]
    fn test_sweep_reports_stale_claims_and_services() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ManifestRepository::new(dir.path().join("manifest.json"), Duration::from_secs(5));
        let services = ServiceRegistry::new(dir.path().join("status.json"), Duration::from_secs(5));

        for i in 1..=3 {
            let path = dir.path().join(format!("img_{}.png", i));
            std::fs::write(&path, b"px").unwrap();
            repo.append(Entry::new(format!("e{}", i), path)).unwrap();
        }
        repo.claim_batch(2, ProcessingStatus::Pending, ProcessingStatus::Processing)
            .unwrap();
        services.register("analysis").unwrap();

        let fresh = SupervisorCycle::new(repo.clone(), services.clone(), Duration::from_secs(3600), Duration::from_secs(3600));
        let report = fresh.sweep().unwrap();
        assert!(report.stale_claims.is_empty());
        assert!(report.stale_services.is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let strict = SupervisorCycle::new(repo, services, Duration::from_millis(1), Duration::from_millis(1));
        let report = strict.sweep().unwrap();
        let ids: Vec<&str> = report.stale_claims.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(report.stale_services, vec!["analysis".to_string()]);
    }

    #[test]
    fn test_sweep_runs_eviction_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ManifestRepository::new(dir.path().join("manifest.json"), Duration::from_secs(5));
        let services = ServiceRegistry::new(dir.path().join("status.json"), Duration::from_secs(5));
        for i in 1..=4 {
            let path = dir.path().join(format!("img_{}.png", i));
            std::fs::write(&path, b"px").unwrap();
            repo.append(Entry::new(format!("e{}", i), path)).unwrap();
        }

        let cycle = SupervisorCycle::new(repo.clone(), services, Duration::from_secs(60), Duration::from_secs(60))
            .with_eviction(EvictionManager::new(repo, 2, false));
        assert_eq!(cycle.sweep().unwrap().evicted, 2);
    }

    #[tokio::test]
    async fn test_corrupt_status_file_does_not_stop_supervisor() {
        use crate::error::{CoordError, StateKind};
        use crate::worker::{ShutdownController, Worker};

        let dir = tempfile::tempdir().unwrap();
        let repo = ManifestRepository::new(dir.path().join("manifest.json"), Duration::from_secs(5));
        let status_path = dir.path().join("status.json");
        std::fs::write(&status_path, b"{\"analysis\": ").unwrap();
        let services = ServiceRegistry::new(&status_path, Duration::from_secs(5));

        let cycle = SupervisorCycle::new(repo, services.clone(), Duration::from_secs(60), Duration::from_secs(60));
        let err = cycle.sweep().unwrap_err();
        assert!(matches!(err, CoordError::CorruptState { kind: StateKind::Status, .. }));
        assert!(!err.is_fatal());

        let controller = ShutdownController::new();
        let worker = Worker::new(cycle, controller.signal(), Duration::from_millis(10)).with_status(services);
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        controller.trigger();
        let exit = handle.await.unwrap().unwrap();
        assert!(exit.units >= 2);
        assert_eq!(std::fs::read(&status_path).unwrap(), b"{\"analysis\": ");
    }
}
