//! Typed operations over the shared processing manifest.
//!
//! Every operation is one lock acquisition: read the document, apply the
//! change, write it back atomically, release. Long-running work (analysis,
//! transfers) happens between operations, never inside one.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{Entry, EntryId, EntryPatch, ProcessingStatus};
use crate::error::{CoordError, Result, StateKind};
use crate::store::LockedStore;

pub const MANIFEST_VERSION: u32 = 1;

/// On-disk layout of the manifest file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDoc {
    pub version: u32,
    pub next_sequence: u64,
    pub entries: Vec<Entry>,
}

impl Default for ManifestDoc {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            next_sequence: 1,
            entries: Vec::new(),
        }
    }
}

impl ManifestDoc {
    fn position(&self, id: &EntryId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    /// Indices of entries ordered oldest `sequence` first.
    fn oldest_first(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.entries.len()).collect();
        idx.sort_by_key(|&i| self.entries[i].sequence);
        idx
    }
}

/// Precondition on an entry's status checked under the lock before a guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusGuard {
    Exactly(ProcessingStatus),
    AtLeast(ProcessingStatus),
}

impl StatusGuard {
    pub fn admits(&self, status: ProcessingStatus) -> bool {
        match self {
            StatusGuard::Exactly(s) => status == *s,
            StatusGuard::AtLeast(s) => status >= *s,
        }
    }

    fn describe(&self) -> String {
        match self {
            StatusGuard::Exactly(s) => s.to_string(),
            StatusGuard::AtLeast(s) => format!(">= {}", s),
        }
    }
}

/// Result of one stale-claim sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReclaimOutcome {
    /// Re-claimed for another attempt; still `processing`, claim time refreshed.
    pub reclaimed: Vec<Entry>,
    /// Out of attempts; advanced to `processed` with a processing error.
    pub abandoned: Vec<EntryId>,
}

/// Counts shown by operator tooling.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ManifestSummary {
    pub total: usize,
    pub by_status: BTreeMap<ProcessingStatus, usize>,
    pub synced: usize,
    pub with_local_path: usize,
    pub processing_errors: usize,
}

#[derive(Debug, Clone)]
pub struct ManifestRepository {
    store: LockedStore<ManifestDoc>,
}

impl ManifestRepository {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            store: LockedStore::new(path, lock_timeout).with_kind(StateKind::Manifest),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    fn check_version(&self, doc: &ManifestDoc) -> Result<()> {
        if doc.version == 0 || doc.version > MANIFEST_VERSION {
            return Err(CoordError::corrupt(
                StateKind::Manifest,
                self.path(),
                format!("unsupported manifest version {}", doc.version),
            ));
        }
        Ok(())
    }

    fn read_doc(&self) -> Result<ManifestDoc> {
        let doc = self.store.load()?;
        self.check_version(&doc)?;
        Ok(doc)
    }

    /// Run `f` under the lock. `f` reports whether it changed the document;
    /// unchanged documents are not rewritten.
    fn transact<R>(&self, f: impl FnOnce(&mut ManifestDoc) -> Result<(R, bool)>) -> Result<R> {
        let locked = self.store.acquire()?;
        let mut doc = locked.read()?;
        self.check_version(&doc)?;
        let (out, changed) = f(&mut doc)?;
        if changed {
            locked.write(&doc)?;
        }
        Ok(out)
    }

    /// Record a new capture as `pending`. Fails with `DuplicateId` if the id is taken.
    pub fn append(&self, entry: Entry) -> Result<Entry> {
        let mut added = self.append_many(vec![entry])?;
        Ok(added.remove(0))
    }

    /// Append several captures under one lock acquisition; all or nothing.
    pub fn append_many(&self, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let result = self.transact(|doc| {
            let mut seen: HashSet<&EntryId> = doc.entries.iter().map(|e| &e.id).collect();
            for e in &entries {
                if !seen.insert(&e.id) {
                    return Err(CoordError::DuplicateId(e.id.clone()));
                }
            }

            let now = Utc::now();
            let mut added = Vec::with_capacity(entries.len());
            for mut e in entries {
                e.sequence = doc.next_sequence;
                doc.next_sequence += 1;
                e.processing_status = ProcessingStatus::Pending;
                e.image_synced = false;
                e.created_at = now;
                e.claimed_at = None;
                e.claim_attempts = 0;
                e.processed_at = None;
                e.transmitted_at = None;
                added.push(e.clone());
                doc.entries.push(e);
            }
            Ok((added, true))
        });

        match &result {
            Ok(added) => log::info!("📝 Added {} new entries to manifest", added.len()),
            Err(CoordError::DuplicateId(id)) => {
                log::warn!("⚠️  Rejected append: entry {} already exists", id)
            }
            Err(_) => {}
        }
        result
    }

    /// Atomically move up to `max_count` of the oldest `from` entries to `to`.
    ///
    /// Selection and transition happen under the same lock, so two claimants
    /// racing on the same pool never receive the same entry.
    pub fn claim_batch(
        &self,
        max_count: usize,
        from: ProcessingStatus,
        to: ProcessingStatus,
    ) -> Result<Vec<Entry>> {
        if to <= from {
            return Err(CoordError::InvalidRequest(format!(
                "claim must advance status, got {} -> {}",
                from, to
            )));
        }
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let claimed = self.transact(|doc| {
            let now = Utc::now();
            let patch = EntryPatch::new().status(to);
            let mut claimed = Vec::new();
            for i in doc.oldest_first() {
                if claimed.len() >= max_count {
                    break;
                }
                let entry = &mut doc.entries[i];
                if entry.processing_status != from {
                    continue;
                }
                entry.apply(&patch, now)?;
                claimed.push(entry.clone());
            }
            let changed = !claimed.is_empty();
            Ok((claimed, changed))
        })?;

        if !claimed.is_empty() {
            log::info!("📥 Claimed {} entries ({} -> {})", claimed.len(), from, to);
        }
        Ok(claimed)
    }

    /// Optimistic update: fails with `StaleState` unless the entry is still `expected`.
    pub fn update_status(
        &self,
        id: &EntryId,
        expected: ProcessingStatus,
        new: ProcessingStatus,
        patch: EntryPatch,
    ) -> Result<Entry> {
        let patch = patch.status(new);
        self.update_guarded(id, StatusGuard::Exactly(expected), move |_| Ok(patch))
    }

    /// Check `guard` under the lock, let `f` inspect the fresh entry (and do any
    /// side effect that must be atomic with the commit), then apply its patch.
    pub fn update_guarded<F>(&self, id: &EntryId, guard: StatusGuard, f: F) -> Result<Entry>
    where
        F: FnOnce(&Entry) -> Result<EntryPatch>,
    {
        let result = self.transact(|doc| {
            let idx = doc
                .position(id)
                .ok_or_else(|| CoordError::NotFound(id.clone()))?;
            let current = &doc.entries[idx];
            if !guard.admits(current.processing_status) {
                return Err(CoordError::StaleState {
                    id: id.clone(),
                    expected: guard.describe(),
                    found: current.processing_status,
                });
            }

            let patch = f(current)?;
            let entry = &mut doc.entries[idx];
            let before = entry.processing_status;
            entry.apply(&patch, Utc::now())?;
            if entry.processing_status != before {
                log::info!("🔄 Entry {}: {} -> {}", id, before, entry.processing_status);
            }
            Ok((entry.clone(), true))
        });

        if let Err(e @ CoordError::StaleState { .. }) = &result {
            log::warn!("⚠️  Guarded update lost a race: {}", e);
        }
        result
    }

    /// Read-only scan, oldest `sequence` first.
    pub fn query(&self, predicate: impl Fn(&Entry) -> bool) -> Result<Vec<Entry>> {
        let doc = self.read_doc()?;
        let mut hits: Vec<Entry> = doc.entries.into_iter().filter(|e| predicate(e)).collect();
        hits.sort_by_key(|e| e.sequence);
        Ok(hits)
    }

    pub fn get(&self, id: &EntryId) -> Result<Entry> {
        let doc = self.read_doc()?;
        doc.entries
            .into_iter()
            .find(|e| &e.id == id)
            .ok_or_else(|| CoordError::NotFound(id.clone()))
    }

    pub fn all(&self) -> Result<Vec<Entry>> {
        self.query(|_| true)
    }

    /// `processing` entries whose claim is older than `older_than` as of `now`.
    pub fn query_stale(&self, older_than: Duration, now: DateTime<Utc>) -> Result<Vec<Entry>> {
        let cutoff = cutoff(now, older_than);
        self.query(|e| is_stale(e, cutoff))
    }

    /// Re-claim up to `max_count` stale `processing` entries without regressing them.
    ///
    /// Entries that have already been claimed `max_attempts` times are given
    /// up on: advanced to `processed` with a processing error so downstream
    /// stages are not blocked forever.
    pub fn reclaim_stale(
        &self,
        max_count: usize,
        older_than: Duration,
        max_attempts: u32,
    ) -> Result<ReclaimOutcome> {
        if max_count == 0 {
            return Ok(ReclaimOutcome::default());
        }

        let outcome = self.transact(|doc| {
            let now = Utc::now();
            let cutoff = cutoff(now, older_than);
            let mut outcome = ReclaimOutcome::default();
            for i in doc.oldest_first() {
                if outcome.reclaimed.len() + outcome.abandoned.len() >= max_count {
                    break;
                }
                let entry = &mut doc.entries[i];
                if !is_stale(entry, cutoff) {
                    continue;
                }
                if entry.claim_attempts >= max_attempts {
                    let patch = EntryPatch::new()
                        .status(ProcessingStatus::Processed)
                        .processing_error(format!(
                            "abandoned after {} claim attempts",
                            entry.claim_attempts
                        ));
                    entry.apply(&patch, now)?;
                    outcome.abandoned.push(entry.id.clone());
                } else {
                    entry.claimed_at = Some(now);
                    entry.claim_attempts += 1;
                    outcome.reclaimed.push(entry.clone());
                }
            }
            let changed = !outcome.reclaimed.is_empty() || !outcome.abandoned.is_empty();
            Ok((outcome, changed))
        })?;

        if !outcome.reclaimed.is_empty() {
            log::warn!("♻️  Re-claimed {} stale processing entries", outcome.reclaimed.len());
        }
        for id in &outcome.abandoned {
            log::error!("❌ Gave up on entry {} after repeated stale claims", id);
        }
        Ok(outcome)
    }

    pub fn summary(&self) -> Result<ManifestSummary> {
        let doc = self.read_doc()?;
        let mut summary = ManifestSummary {
            total: doc.entries.len(),
            ..Default::default()
        };
        for status in ProcessingStatus::all() {
            summary.by_status.insert(status, 0);
        }
        for e in &doc.entries {
            *summary.by_status.entry(e.processing_status).or_insert(0) += 1;
            if e.image_synced {
                summary.synced += 1;
            }
            if e.local_path.is_some() {
                summary.with_local_path += 1;
            }
            if e.processing_error.is_some() {
                summary.processing_errors += 1;
            }
        }
        Ok(summary)
    }

    /// Raw manifest bytes read under the lock, for mirroring.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        self.store.snapshot_bytes()
    }
}

fn cutoff(now: DateTime<Utc>, older_than: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn is_stale(entry: &Entry, cutoff: DateTime<Utc>) -> bool {
    entry.processing_status == ProcessingStatus::Processing
        && entry.claimed_at.unwrap_or(entry.created_at) <= cutoff
}
