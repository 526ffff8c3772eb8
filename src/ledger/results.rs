use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result, StateKind};
use crate::manifest::EntryId;
use crate::store::{self, LockGuard};

/// One completed analysis. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub entry_id: EntryId,
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl ResultRecord {
    pub fn new(entry_id: EntryId, payload: serde_json::Value) -> Self {
        Self {
            entry_id,
            recorded_at: Utc::now(),
            payload,
        }
    }

    /// Record for an analysis that failed, so the ledger accounts for every
    /// entry that left `processing`.
    pub fn failure(entry_id: EntryId, message: impl Into<String>) -> Self {
        Self::new(
            entry_id,
            serde_json::json!({
                "processing_successful": false,
                "processing_error_message": message.into(),
            }),
        )
    }

    pub fn is_failure(&self) -> bool {
        self.payload.get("processing_successful") == Some(&serde_json::Value::Bool(false))
    }
}

/// UTC stamp used in rotated file names; lexical order is chronological.
const ROTATION_STAMP: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Append-only JSONL log of analysis results.
///
/// There is no update or delete. The only way records leave the live file is
/// rotation to `results.jsonl.<UTC stamp>`. Rotation never removes or renames
/// an earlier rotated file; those are left for the external archival step,
/// which is the only thing allowed to delete them.
#[derive(Debug, Clone)]
pub struct ResultsLedger {
    path: PathBuf,
    lock_timeout: Duration,
    max_size: u64,
    archive_warn_after: u32,
}

impl ResultsLedger {
    /// `max_size_mb == 0` disables automatic rotation.
    ///
    /// `max_rotations` does not bound what is kept on disk: once more rotated
    /// files than that are waiting, each rotation logs that archival is behind.
    pub fn new(
        path: impl Into<PathBuf>,
        lock_timeout: Duration,
        max_size_mb: u64,
        max_rotations: u32,
    ) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
            max_size: max_size_mb * 1024 * 1024,
            archive_warn_after: max_rotations.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<LockGuard> {
        store::acquire(&self.path, self.lock_timeout)
    }

    /// Durably append one record. Returns once the line is on disk.
    pub fn append(&self, record: &ResultRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let _guard = self.lock()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // A torn line from a crashed writer must not swallow this record.
        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                log::warn!("⚠️  {} did not end with a newline", self.path.display());
                file.write_all(b"\n")?;
            }
        }

        writeln!(file, "{}", json)?;
        file.flush()?;
        file.sync_data()?;
        log::debug!("📝 Recorded result for {}", record.entry_id);

        let size = file.metadata()?.len();
        drop(file);
        if self.max_size > 0 && size >= self.max_size {
            self.rotate_locked()?;
        }
        Ok(())
    }

    /// Rotate the live file now, regardless of size.
    pub fn rotate(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.rotate_locked()
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Sort key for a rotated file name, or `None` for siblings that are not
    /// rotations (the lock file, partial uploads).
    fn rotation_key(&self, name: &str) -> Option<(String, u32)> {
        let prefix = format!("{}.", self.file_name());
        let suffix = name.strip_prefix(&prefix)?;
        if !suffix.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        match suffix.split_once('-') {
            Some((stamp, n)) => Some((stamp.to_string(), n.parse().ok()?)),
            None => Some((suffix.to_string(), 0)),
        }
    }

    fn list_rotated(&self) -> Result<Vec<PathBuf>> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rotated = Vec::new();
        for item in read_dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            if let Some(key) = self.rotation_key(&name) {
                rotated.push((key, item.path()));
            }
        }
        rotated.sort();
        Ok(rotated.into_iter().map(|(_, path)| path).collect())
    }

    /// Rotated ledger files still on disk, oldest first.
    pub fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.lock()?;
        self.list_rotated()
    }

    fn next_rotated_path(&self) -> PathBuf {
        let stamp = Utc::now().format(ROTATION_STAMP).to_string();
        let base = format!("{}.{}", self.file_name(), stamp);
        let mut candidate = self.path.with_file_name(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.path.with_file_name(format!("{}-{}", base, n));
            n += 1;
        }
        candidate
    }

    fn rotate_locked(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let target = self.next_rotated_path();
        std::fs::rename(&self.path, &target)?;
        log::info!("📄 Rotated results ledger to {}", target.display());

        let waiting = self.list_rotated()?.len();
        if waiting > self.archive_warn_after as usize {
            log::warn!(
                "⚠️  {} rotated ledger files awaiting archival (threshold {})",
                waiting,
                self.archive_warn_after
            );
        }
        Ok(())
    }

    /// Every record in the live file, in append order.
    pub fn read_all(&self) -> Result<Vec<ResultRecord>> {
        let _guard = self.lock()?;
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                CoordError::corrupt(StateKind::Ledger, self.path.clone(), format!("line {}: {}", n + 1, e))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Raw bytes of the live file, read under the lock, for mirroring.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let _guard = self.lock()?;
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
