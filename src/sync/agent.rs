//! Local-first replication of processed artifacts to the remote store.
//!
//! A pass walks unsynced `processed`/`transmitted` entries oldest first. Each
//! transfer runs with no lock held. Only once the remote confirms the object
//! does a guarded commit set `image_synced`. The first failed transfer ends the
//! pass and leaves that entry exactly as it was, so it is retried next pass.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::remote::RemoteStore;
use crate::error::{CoordError, Result};
use crate::ledger::ResultsLedger;
use crate::manifest::{Entry, EntryId, EntryPatch, ManifestRepository, ProcessingStatus, StatusGuard};
use crate::worker::{UnitOutcome, WorkUnit};

/// What happens to the local artifact once it is safely on the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncTransfer {
    /// Leave it for the eviction manager.
    #[default]
    Copy,
    /// Delete it right after the synced commit.
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub id: EntryId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: Vec<EntryId>,
    /// Candidates with no artifact left on disk.
    pub skipped: Vec<EntryId>,
    /// The transfer that ended the pass early, if any.
    pub failed: Option<SyncFailure>,
}

/// Directory on the remote that holds manifest and ledger snapshots.
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Directory on the remote that holds rotated ledger files, one object each.
pub const LEDGER_ARCHIVE_DIR: &str = "ledger_archive";

pub struct SyncAgent {
    repo: ManifestRepository,
    ledger: Option<ResultsLedger>,
    remote: Arc<dyn RemoteStore>,
    transfer: SyncTransfer,
}

impl SyncAgent {
    pub fn new(repo: ManifestRepository, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            repo,
            ledger: None,
            remote,
            transfer: SyncTransfer::Copy,
        }
    }

    /// Also mirror this ledger in `mirror_snapshots`.
    pub fn with_ledger(mut self, ledger: ResultsLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_transfer(mut self, transfer: SyncTransfer) -> Self {
        self.transfer = transfer;
        self
    }

    /// One pass over every current sync candidate.
    pub async fn sync_pass(&self) -> Result<SyncReport> {
        let candidates = self.repo.query(Entry::is_sync_candidate)?;
        let mut report = SyncReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }
        log::info!("🔄 Sync pass: {} candidates -> {}", candidates.len(), self.remote.describe());

        for entry in candidates {
            let Some(local) = entry.local_path.clone().filter(|p| p.exists()) else {
                log::warn!("⚠️  No local artifact for {}, skipping", entry.id);
                report.skipped.push(entry.id.clone());
                continue;
            };

            let name = remote_name(&entry);
            let remote_ref = match self.remote.put_file(&name, &local).await {
                Ok(r) => r,
                Err(e) => {
                    log::error!("❌ Transfer of {} failed, ending pass: {}", entry.id, e);
                    report.failed = Some(SyncFailure {
                        id: entry.id.clone(),
                        reason: e.to_string(),
                    });
                    break;
                }
            };

            match self.commit(&entry, &local, remote_ref) {
                Ok(()) => report.synced.push(entry.id.clone()),
                Err(CoordError::InvalidRequest(reason)) => {
                    log::debug!("Not committing {}: {}", entry.id, reason);
                }
                Err(e @ CoordError::NotFound(_)) => {
                    log::warn!("⚠️  {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if !report.synced.is_empty() {
            log::info!("✅ Synced {} artifacts", report.synced.len());
        }
        Ok(report)
    }

    /// Mark the entry synced, then (in move mode) drop the local copy.
    fn commit(&self, entry: &Entry, uploaded: &Path, remote_ref: String) -> Result<()> {
        self.repo
            .update_guarded(&entry.id, StatusGuard::AtLeast(ProcessingStatus::Processed), |fresh| {
                if fresh.local_path.as_deref() != Some(uploaded) {
                    return Err(CoordError::InvalidRequest(
                        "artifact changed during transfer".into(),
                    ));
                }
                Ok(EntryPatch::new().synced(remote_ref))
            })?;

        if self.transfer == SyncTransfer::Move {
            if let Err(e) = self.remove_local(&entry.id) {
                log::warn!("⚠️  Synced {} but could not remove local copy: {}", entry.id, e);
            }
        }
        Ok(())
    }

    fn remove_local(&self, id: &EntryId) -> Result<()> {
        self.repo
            .update_guarded(id, StatusGuard::AtLeast(ProcessingStatus::Processed), |fresh| {
                if !fresh.image_synced {
                    return Err(CoordError::InvalidRequest("not synced".into()));
                }
                let Some(path) = fresh.local_path.as_deref() else {
                    return Ok(EntryPatch::new());
                };
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(EntryPatch::new().clear_local_path())
            })
            .map(|_| ())
    }

    /// Upload point-in-time copies of the manifest and the results ledger.
    ///
    /// Each file is read under its own lock; the upload happens after release.
    pub async fn mirror_snapshots(&self) -> Result<usize> {
        let mut mirrored = 0;

        let manifest = self.repo.snapshot_bytes()?;
        self.put_snapshot(self.repo.path(), &manifest).await?;
        mirrored += 1;

        if let Some(ledger) = &self.ledger {
            let records = ledger.snapshot_bytes()?;
            self.put_snapshot(ledger.path(), &records).await?;
            mirrored += 1;
        }

        log::debug!("Mirrored {} snapshots", mirrored);
        Ok(mirrored)
    }

    /// Upload rotated ledger files the remote does not hold yet.
    ///
    /// Rotated files are never written again, so they are read without the
    /// ledger lock; only the listing is taken under it. A file the archival
    /// step removed in the meantime is skipped.
    pub async fn mirror_ledger_archive(&self) -> Result<usize> {
        let Some(ledger) = &self.ledger else {
            return Ok(0);
        };

        let mut uploaded = 0;
        for local in ledger.rotated_files()? {
            let Some(file) = local.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let object = format!("{}/{}", LEDGER_ARCHIVE_DIR, file);

            let present = self
                .remote
                .exists(&object)
                .await
                .map_err(|source| CoordError::Transfer { object: object.clone(), source })?;
            if present {
                continue;
            }

            match self.remote.put_file(&object, &local).await {
                Ok(_) => {
                    log::info!("📦 Archived {} to {}", local.display(), object);
                    uploaded += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && !local.exists() => {
                    log::debug!("{} removed before upload", local.display());
                }
                Err(source) => return Err(CoordError::Transfer { object, source }),
            }
        }
        Ok(uploaded)
    }

    async fn put_snapshot(&self, local: &Path, bytes: &[u8]) -> Result<()> {
        let file = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        let object = format!("{}/{}", SNAPSHOT_DIR, file);
        self.remote
            .put_bytes(&object, bytes)
            .await
            .map(|_| ())
            .map_err(|source| CoordError::Transfer { object, source })
    }
}

/// Deterministic remote object name: the entry id plus the artifact's extension.
///
/// Re-sending an entry whose commit was lost lands on the same name, so the
/// remote never holds two copies of one capture.
pub fn remote_name(entry: &Entry) -> String {
    let ext = entry
        .local_path
        .as_deref()
        .and_then(Path::extension)
        .map(|e| e.to_string_lossy().into_owned());
    match ext {
        Some(ext) if !ext.is_empty() => format!("{}.{}", entry.id, ext),
        _ => entry.id.to_string(),
    }
}

#[async_trait]
impl WorkUnit for SyncAgent {
    fn name(&self) -> &str {
        "sync-agent"
    }

    async fn run_once(&mut self) -> Result<UnitOutcome> {
        let report = self.sync_pass().await?;

        if !report.synced.is_empty() {
            if let Err(e) = self.mirror_snapshots().await {
                log::warn!("⚠️  Snapshot mirror failed: {}", e);
            }
        }

        if report.failed.is_none() {
            if let Err(e) = self.mirror_ledger_archive().await {
                log::warn!("⚠️  Ledger archive mirror failed: {}", e);
            }
        }

        if let Some(failure) = report.failed {
            return Err(CoordError::Transfer {
                object: failure.id.to_string(),
                source: io::Error::other(failure.reason),
            });
        }

        Ok(match report.synced.len() {
            0 => UnitOutcome::Idle,
            n => UnitOutcome::Worked(n),
        })
    }
}
