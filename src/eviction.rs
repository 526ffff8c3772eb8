//! Ring-buffer eviction of local artifacts.
//!
//! Keeps the number of artifacts on local disk near `buffer_size` without ever
//! deleting one that has not reached the remote store. The bound is soft: if
//! the oldest artifacts are all unsynced, nothing is deleted and local usage
//! keeps growing until sync catches up.

use std::io::ErrorKind;

use crate::error::{CoordError, Result};
use crate::manifest::{Entry, EntryId, EntryPatch, ManifestRepository, ProcessingStatus, StatusGuard};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EvictionReport {
    /// Entries with a local artifact before the pass.
    pub local_count: usize,
    pub deleted: Vec<EntryId>,
    /// Oldest-window entries kept because they are not synced yet.
    pub blocked: Vec<EntryId>,
}

impl EvictionReport {
    pub fn remaining(&self) -> usize {
        self.local_count - self.deleted.len()
    }
}

#[derive(Debug, Clone)]
pub struct EvictionManager {
    repo: ManifestRepository,
    buffer_size: usize,
    sync_enabled: bool,
}

impl EvictionManager {
    /// `buffer_size == 0` disables eviction.
    pub fn new(repo: ManifestRepository, buffer_size: usize, sync_enabled: bool) -> Self {
        Self {
            repo,
            buffer_size,
            sync_enabled,
        }
    }

    fn evictable(&self, entry: &Entry) -> bool {
        !self.sync_enabled || entry.image_synced
    }

    /// Capture-side entry point: record the new artifact, then reconcile.
    pub fn record_and_evict(&self, entry: Entry) -> Result<(Entry, EvictionReport)> {
        let recorded = self.repo.append(entry)?;
        let report = self.run_pass()?;
        Ok((recorded, report))
    }

    /// One reconciliation pass; run after each new artifact is recorded.
    pub fn run_pass(&self) -> Result<EvictionReport> {
        let local = self.repo.query(Entry::has_local_artifact)?;
        let mut report = EvictionReport {
            local_count: local.len(),
            ..Default::default()
        };

        if self.buffer_size == 0 || local.len() <= self.buffer_size {
            log::debug!(
                "🗂️  {} local artifacts within buffer of {}",
                local.len(),
                self.buffer_size
            );
            return Ok(report);
        }

        let excess = local.len() - self.buffer_size;
        log::info!(
            "🗂️  Buffer limit exceeded ({} > {}), checking {} oldest artifacts",
            local.len(),
            self.buffer_size,
            excess
        );

        for candidate in &local[..excess] {
            if !self.evictable(candidate) {
                log::warn!("⚠️  Unsynced artifact will not be removed: {}", candidate.id);
                report.blocked.push(candidate.id.clone());
                continue;
            }

            match self.evict(&candidate.id) {
                Ok(()) => report.deleted.push(candidate.id.clone()),
                Err(CoordError::InvalidRequest(reason)) | Err(CoordError::InvalidTransition { reason, .. }) => {
                    log::debug!("Skipping {}: {}", candidate.id, reason);
                }
                Err(e @ CoordError::NotFound(_)) | Err(e @ CoordError::StaleState { .. }) => {
                    log::warn!("⚠️  Skipping {}: {}", candidate.id, e);
                }
                Err(e) => return Err(e),
            }
        }

        if !report.deleted.is_empty() {
            log::info!("🧹 Removed {} local artifacts", report.deleted.len());
        }
        Ok(report)
    }

    /// Delete the artifact and clear `local_path` in the same guarded update,
    /// re-checking eligibility against the entry as it is under the lock.
    fn evict(&self, id: &EntryId) -> Result<()> {
        self.repo
            .update_guarded(id, StatusGuard::AtLeast(ProcessingStatus::Pending), |fresh| {
                if !self.evictable(fresh) {
                    return Err(CoordError::InvalidRequest("no longer evictable".into()));
                }
                let Some(path) = fresh.local_path.as_deref() else {
                    return Err(CoordError::InvalidRequest("no local artifact".into()));
                };
                match std::fs::remove_file(path) {
                    Ok(()) => log::debug!("Deleted {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(EntryPatch::new().clear_local_path())
            })
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn seeded(dir: &Path, n: usize) -> ManifestRepository {
        let repo = ManifestRepository::new(dir.join("manifest.json"), Duration::from_secs(5));
        for i in 1..=n {
            let path = dir.join(format!("img_{}.png", i));
            std::fs::write(&path, b"px").unwrap();
            repo.append(Entry::new(format!("e{}", i), path)).unwrap();
        }
        repo
    }

    #[test]
    fn test_within_buffer_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded(dir.path(), 2);
        let report = EvictionManager::new(repo, 3, true).run_pass().unwrap();
        assert_eq!(report.local_count, 2);
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn test_disabled_when_buffer_zero() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded(dir.path(), 4);
        let report = EvictionManager::new(repo, 0, false).run_pass().unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.remaining(), 4);
    }

    #[test]
    fn test_local_only_mode_deletes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded(dir.path(), 5);
        let report = EvictionManager::new(repo.clone(), 3, false).run_pass().unwrap();

        let deleted: Vec<&str> = report.deleted.iter().map(|id| id.as_str()).collect();
        assert_eq!(deleted, vec!["e1", "e2"]);
        assert!(!dir.path().join("img_1.png").exists());
        assert!(dir.path().join("img_3.png").exists());

        let e1 = repo.get(&EntryId::from("e1")).unwrap();
        assert!(e1.local_path.is_none());
        assert_eq!(repo.query(Entry::has_local_artifact).unwrap().len(), 3);
    }

    #[test]
    fn test_record_and_evict_keeps_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded(dir.path(), 3);
        let manager = EvictionManager::new(repo.clone(), 3, false);

        let path = dir.path().join("img_4.png");
        std::fs::write(&path, b"px").unwrap();
        let (recorded, report) = manager.record_and_evict(Entry::new("e4", path)).unwrap();

        assert_eq!(recorded.sequence, 4);
        assert_eq!(report.deleted, vec![EntryId::from("e1")]);
        assert_eq!(report.remaining(), 3);
    }

    #[test]
    fn test_missing_file_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded(dir.path(), 4);
        std::fs::remove_file(dir.path().join("img_4.png")).unwrap();
        let report = EvictionManager::new(repo, 3, false).run_pass().unwrap();
        assert_eq!(report.local_count, 3);
        assert!(report.deleted.is_empty());
    }
}
