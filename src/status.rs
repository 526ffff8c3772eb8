//! Lock-protected service status file (`pipeline_status.json`).
//!
//! Each worker records its state, pid, and a heartbeat after every unit of
//! work. Operator tooling and the supervisor read it to spot dead or hung
//! workers; nothing in the coordination core depends on it for correctness.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateKind};
use crate::store::LockedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

pub type StatusMap = BTreeMap<String, ServiceStatus>;

#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    store: LockedStore<StatusMap>,
}

impl ServiceRegistry {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            store: LockedStore::new(path, lock_timeout).with_kind(StateKind::Status),
        }
    }

    /// Mark `service` running under this process's pid.
    pub fn register(&self, service: &str) -> Result<()> {
        let pid = std::process::id();
        self.store.update(|map| {
            map.insert(
                service.to_string(),
                ServiceStatus {
                    state: ServiceState::Running,
                    pid: Some(pid),
                    last_heartbeat: Some(Utc::now()),
                },
            );
            Ok(())
        })?;
        log::info!("✅ Registered service {} (pid {})", service, pid);
        Ok(())
    }

    pub fn heartbeat(&self, service: &str) -> Result<()> {
        self.store.update(|map| {
            let status = map
                .entry(service.to_string())
                .or_insert_with(|| ServiceStatus {
                    state: ServiceState::Running,
                    pid: Some(std::process::id()),
                    last_heartbeat: None,
                });
            status.last_heartbeat = Some(Utc::now());
            Ok(())
        })
    }

    pub fn set_state(&self, service: &str, state: ServiceState) -> Result<()> {
        self.store.update(|map| {
            let status = map
                .entry(service.to_string())
                .or_insert_with(|| ServiceStatus {
                    state,
                    pid: Some(std::process::id()),
                    last_heartbeat: None,
                });
            status.state = state;
            if matches!(state, ServiceState::Stopped | ServiceState::Failed) {
                status.pid = None;
            }
            Ok(())
        })
    }

    pub fn all(&self) -> Result<StatusMap> {
        self.store.load()
    }

    /// Services that claim to be running but have not heartbeated within `max_age`.
    pub fn stale_services(&self, max_age: Duration, now: DateTime<Utc>) -> Result<Vec<(String, ServiceStatus)>> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        Ok(self
            .all()?
            .into_iter()
            .filter(|(_, s)| s.state == ServiceState::Running)
            .filter(|(_, s)| match s.last_heartbeat {
                Some(hb) => now.signed_duration_since(hb) > max_age,
                None => true,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_heartbeat_stop() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::new(dir.path().join("pipeline_status.json"), Duration::from_secs(2));

        reg.register("sync-agent").unwrap();
        reg.heartbeat("sync-agent").unwrap();
        let all = reg.all().unwrap();
        let s = &all["sync-agent"];
        assert_eq!(s.state, ServiceState::Running);
        assert_eq!(s.pid, Some(std::process::id()));
        assert!(s.last_heartbeat.is_some());

        reg.set_state("sync-agent", ServiceState::Stopped).unwrap();
        let s = &reg.all().unwrap()["sync-agent"];
        assert_eq!(s.state, ServiceState::Stopped);
        assert_eq!(s.pid, None);
    }

    #[test]
    fn test_stale_services() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::new(dir.path().join("pipeline_status.json"), Duration::from_secs(2));
        reg.register("analysis").unwrap();
        reg.register("sync-agent").unwrap();
        reg.set_state("sync-agent", ServiceState::Stopped).unwrap();

        assert!(reg.stale_services(Duration::from_secs(60), Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(600);
        let stale = reg.stale_services(Duration::from_secs(60), later).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "analysis");
    }
}
