//! The analysis claim cycle: claim, release, work, recommit.
//!
//! Entries are claimed `pending -> processing` under the manifest lock, the
//! lock is released, the analyzer runs, and each outcome is committed back with
//! its own short lock acquisition. A crash between claim and commit leaves the
//! entry `processing`; the optional stale policy re-claims it later.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CoordError, Result};
use crate::ledger::{ResultRecord, ResultsLedger};
use crate::manifest::{Entry, EntryPatch, ManifestRepository, ProcessingStatus};

use super::backoff::ExponentialBackoff;
use super::runner::{UnitOutcome, WorkUnit};

pub type AnalyzerError = Box<dyn StdError + Send + Sync>;

/// Analysis algorithm plugged into the cycle. Runs with no lock held.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, entry: &Entry) -> std::result::Result<serde_json::Value, AnalyzerError>;
}

/// When to take over `processing` entries whose claimant went quiet.
#[derive(Debug, Clone, Copy)]
pub struct StalePolicy {
    pub older_than: Duration,
    pub max_attempts: u32,
}

impl StalePolicy {
    /// `None` when `older_than` is zero (policy disabled).
    pub fn from_threshold(older_than: Duration, max_attempts: u32) -> Option<Self> {
        if older_than.is_zero() {
            None
        } else {
            Some(Self {
                older_than,
                max_attempts: max_attempts.max(1),
            })
        }
    }
}

const COMMIT_RETRY_INITIAL: Duration = Duration::from_millis(50);
const COMMIT_RETRY_MAX: Duration = Duration::from_secs(5);

pub struct AnalysisCycle<A: Analyzer> {
    repo: ManifestRepository,
    ledger: ResultsLedger,
    analyzer: A,
    batch_size: usize,
    stale: Option<StalePolicy>,
}

impl<A: Analyzer> AnalysisCycle<A> {
    pub fn new(repo: ManifestRepository, ledger: ResultsLedger, analyzer: A, batch_size: usize) -> Self {
        Self {
            repo,
            ledger,
            analyzer,
            batch_size: batch_size.max(1),
            stale: None,
        }
    }

    pub fn with_stale_policy(mut self, policy: Option<StalePolicy>) -> Self {
        self.stale = policy;
        self
    }

    /// Claim a batch and carry every claimed entry to `processed`.
    ///
    /// Returns the number of entries committed. An entry whose commit fails
    /// does not strand the rest of the batch: every claimed entry is still
    /// analyzed and committed, and the first failure is returned afterwards.
    pub async fn process_batch(&mut self) -> Result<usize> {
        let mut batch = Vec::new();
        if let Some(policy) = self.stale {
            let outcome = self
                .repo
                .reclaim_stale(self.batch_size, policy.older_than, policy.max_attempts)?;
            batch.extend(outcome.reclaimed);
        }
        let room = self.batch_size.saturating_sub(batch.len());
        batch.extend(
            self.repo
                .claim_batch(room, ProcessingStatus::Pending, ProcessingStatus::Processing)?,
        );

        let mut committed = 0;
        let mut first_error = None;
        for entry in batch {
            match self.process_one(&entry).await {
                Ok(()) => committed += 1,
                Err(e @ CoordError::StaleState { .. }) | Err(e @ CoordError::NotFound(_)) => {
                    // Someone else (stale reclaim elsewhere) already finished it.
                    log::warn!("⚠️  Dropping result for {}: {}", entry.id, e);
                }
                Err(e) => {
                    log::error!("❌ Could not commit {}, left processing: {}", entry.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(committed),
        }
    }

    async fn process_one(&self, entry: &Entry) -> Result<()> {
        match self.analyzer.analyze(entry).await {
            Ok(payload) => {
                let record = ResultRecord::new(entry.id.clone(), payload);
                retry_on_lock_timeout(|| self.ledger.append(&record)).await?;
                retry_on_lock_timeout(|| {
                    self.repo.update_status(
                        &entry.id,
                        ProcessingStatus::Processing,
                        ProcessingStatus::Processed,
                        EntryPatch::new(),
                    )
                })
                .await?;
                log::info!("✅ Analyzed {}", entry.id);
            }
            Err(e) => {
                log::error!("❌ Analysis failed for {}: {}", entry.id, e);
                let message = e.to_string();
                let record = ResultRecord::failure(entry.id.clone(), message.clone());
                retry_on_lock_timeout(|| self.ledger.append(&record)).await?;
                retry_on_lock_timeout(|| {
                    self.repo.update_status(
                        &entry.id,
                        ProcessingStatus::Processing,
                        ProcessingStatus::Processed,
                        EntryPatch::new().processing_error(message.clone()),
                    )
                })
                .await?;
            }
        }
        Ok(())
    }
}

/// A finished result is never dropped over a busy lock: the write is retried
/// until the holder lets go. A dead holder's lock is released by the kernel.
async fn retry_on_lock_timeout<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut backoff = ExponentialBackoff::new(COMMIT_RETRY_INITIAL, COMMIT_RETRY_MAX);
    loop {
        match op() {
            Err(e @ CoordError::LockTimeout { .. }) => {
                log::warn!("⚠️  {}", e);
                tokio::time::sleep(backoff.next_delay()).await;
            }
            other => return other,
        }
    }
}

#[async_trait]
impl<A: Analyzer> WorkUnit for AnalysisCycle<A> {
    fn name(&self) -> &str {
        "analysis"
    }

    async fn run_once(&mut self) -> Result<UnitOutcome> {
        let n = self.process_batch().await?;
        Ok(if n == 0 { UnitOutcome::Idle } else { UnitOutcome::Worked(n) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EntryId;
    use crate::store;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SizeAnalyzer;

    #[async_trait]
    impl Analyzer for SizeAnalyzer {
        async fn analyze(&self, entry: &Entry) -> std::result::Result<serde_json::Value, AnalyzerError> {
            let path = entry.local_path.as_deref().ok_or("no local artifact")?;
            let len = std::fs::metadata(path)?.len();
            Ok(json!({ "bytes": len }))
        }
    }

    fn fixture(dir: &Path, n: usize) -> (ManifestRepository, ResultsLedger) {
        let repo = ManifestRepository::new(dir.join("manifest.json"), Duration::from_secs(5));
        let ledger = ResultsLedger::new(dir.join("results.jsonl"), Duration::from_secs(5), 0, 1);
        for i in 1..=n {
            let path = dir.join(format!("img_{}.png", i));
            std::fs::write(&path, vec![0u8; i]).unwrap();
            repo.append(Entry::new(format!("e{}", i), path)).unwrap();
        }
        (repo, ledger)
    }

    #[tokio::test]
    async fn test_batch_reaches_processed_with_results() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, ledger) = fixture(dir.path(), 3);
        let mut cycle = AnalysisCycle::new(repo.clone(), ledger.clone(), SizeAnalyzer, 2);

        assert_eq!(cycle.run_once().await.unwrap(), UnitOutcome::Worked(2));
        assert_eq!(cycle.run_once().await.unwrap(), UnitOutcome::Worked(1));
        assert_eq!(cycle.run_once().await.unwrap(), UnitOutcome::Idle);

        let all = repo.all().unwrap();
        assert!(all.iter().all(|e| e.processing_status == ProcessingStatus::Processed));
        let records = ledger.read_all().unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert_eq!(records[2].payload, json!({ "bytes": 3 }));
    }

    #[tokio::test]
    async fn test_failure_commits_processed_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, ledger) = fixture(dir.path(), 1);
        std::fs::remove_file(dir.path().join("img_1.png")).unwrap();

        let mut cycle = AnalysisCycle::new(repo.clone(), ledger.clone(), SizeAnalyzer, 4);
        assert_eq!(cycle.run_once().await.unwrap(), UnitOutcome::Worked(1));

        let e1 = repo.get(&EntryId::from("e1")).unwrap();
        assert_eq!(e1.processing_status, ProcessingStatus::Processed);
        let message = e1.processing_error.unwrap();

        let records = ledger.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry_id.as_str(), "e1");
        assert!(records[0].is_failure());
        assert_eq!(records[0].payload["processing_error_message"], message.as_str());
    }

    /// Counts calls; on the first one, hands the manifest lock to another
    /// thread that keeps it well past the repository's lock timeout.
    struct HoldsManifestLock {
        manifest: std::path::PathBuf,
        hold: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Analyzer for HoldsManifestLock {
        async fn analyze(&self, entry: &Entry) -> std::result::Result<serde_json::Value, AnalyzerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let (tx, rx) = std::sync::mpsc::channel();
                let manifest = self.manifest.clone();
                let hold = self.hold;
                std::thread::spawn(move || {
                    let _guard = store::acquire(&manifest, Duration::from_secs(5)).unwrap();
                    tx.send(()).unwrap();
                    std::thread::sleep(hold);
                });
                rx.recv()?;
            }
            Ok(json!({ "entry": entry.id.as_str() }))
        }
    }

    #[tokio::test]
    async fn test_busy_manifest_lock_does_not_strand_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ledger) = fixture(dir.path(), 3);
        let repo = ManifestRepository::new(dir.path().join("manifest.json"), Duration::from_millis(100));
        let analyzer = HoldsManifestLock {
            manifest: repo.path().to_path_buf(),
            hold: Duration::from_millis(1500),
            calls: AtomicUsize::new(0),
        };
        let mut cycle = AnalysisCycle::new(repo.clone(), ledger.clone(), analyzer, 3);

        assert_eq!(cycle.run_once().await.unwrap(), UnitOutcome::Worked(3));
        assert_eq!(cycle.analyzer.calls.load(Ordering::SeqCst), 3);
        assert!(repo
            .all()
            .unwrap()
            .iter()
            .all(|e| e.processing_status == ProcessingStatus::Processed));
        assert_eq!(ledger.read_all().unwrap().len(), 3);
    }

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Analyzer for Counting {
        async fn analyze(&self, entry: &Entry) -> std::result::Result<serde_json::Value, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "entry": entry.id.as_str() }))
        }
    }

    #[tokio::test]
    async fn test_commit_error_still_works_whole_batch_and_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = fixture(dir.path(), 3);
        std::fs::write(dir.path().join("blocker"), b"not a directory").unwrap();
        let ledger = ResultsLedger::new(dir.path().join("blocker/results.jsonl"), Duration::from_secs(1), 0, 1);
        let mut cycle = AnalysisCycle::new(
            repo.clone(),
            ledger,
            Counting {
                calls: AtomicUsize::new(0),
            },
            3,
        );

        let err = cycle.run_once().await.unwrap_err();
        assert!(matches!(err, CoordError::Io(_)));
        assert_eq!(cycle.analyzer.calls.load(Ordering::SeqCst), 3);
        // No result on record, so nothing may claim to be processed.
        assert!(repo
            .all()
            .unwrap()
            .iter()
            .all(|e| e.processing_status == ProcessingStatus::Processing));
    }

    #[tokio::test]
    async fn test_stale_claim_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, ledger) = fixture(dir.path(), 1);
        // A claimant that crashed after claiming.
        repo.claim_batch(1, ProcessingStatus::Pending, ProcessingStatus::Processing)
            .unwrap();

        let policy = StalePolicy::from_threshold(Duration::from_millis(1), 3);
        let mut cycle =
            AnalysisCycle::new(repo.clone(), ledger, SizeAnalyzer, 4).with_stale_policy(policy);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cycle.run_once().await.unwrap(), UnitOutcome::Worked(1));
        let e1 = repo.get(&EntryId::from("e1")).unwrap();
        assert_eq!(e1.processing_status, ProcessingStatus::Processed);
        assert_eq!(e1.claim_attempts, 2);
    }

    #[test]
    fn test_zero_threshold_disables_policy() {
        assert!(StalePolicy::from_threshold(Duration::ZERO, 3).is_none());
        assert!(StalePolicy::from_threshold(Duration::from_secs(60), 3).is_some());
    }
}
