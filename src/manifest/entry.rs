//! Manifest entry and the processing-status lattice.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

/// Stable identifier of one captured artifact. Also used as the remote object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Totally ordered: `Pending < Processing < Processed < Transmitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    Transmitted,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Transmitted => "transmitted",
        }
    }

    pub fn all() -> [ProcessingStatus; 4] {
        [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Processed,
            ProcessingStatus::Transmitted,
        ]
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured artifact as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    /// Assigned by the manifest on append; strictly increasing.
    pub sequence: u64,
    pub filename: Option<String>,
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub remote_ref: Option<String>,
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub image_synced: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claim_attempts: u32,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transmitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub collection_error: Option<String>,
    #[serde(default)]
    pub processing_error: Option<String>,
    #[serde(default)]
    pub compression_attempted: bool,
    /// Sensor readings and capture parameters; never interpreted here.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Entry {
    /// A fresh capture record. `sequence` and `created_at` are overwritten on append.
    pub fn new(id: impl Into<EntryId>, local_path: impl Into<PathBuf>) -> Self {
        let local_path = local_path.into();
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Self {
            id: id.into(),
            sequence: 0,
            filename,
            local_path: Some(local_path),
            remote_ref: None,
            processing_status: ProcessingStatus::Pending,
            image_synced: false,
            created_at: Utc::now(),
            claimed_at: None,
            claim_attempts: 0,
            processed_at: None,
            transmitted_at: None,
            collection_error: None,
            processing_error: None,
            compression_attempted: false,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_collection_error(mut self, msg: impl Into<String>) -> Self {
        self.collection_error = Some(msg.into());
        self
    }

    /// True when the manifest still points at a file that exists on disk.
    pub fn has_local_artifact(&self) -> bool {
        self.local_path.as_deref().is_some_and(|p| p.exists())
    }

    pub fn is_sync_candidate(&self) -> bool {
        self.processing_status >= ProcessingStatus::Processed && !self.image_synced
    }

    /// Apply a patch, enforcing the lattice and the synced-implies-processed rule.
    ///
    /// On error the entry is left unchanged.
    pub fn apply(&mut self, patch: &EntryPatch, now: DateTime<Utc>) -> Result<()> {
        let next_status = patch.status.unwrap_or(self.processing_status);
        if next_status < self.processing_status {
            return Err(CoordError::InvalidTransition {
                id: self.id.clone(),
                reason: format!("status cannot regress from {} to {}", self.processing_status, next_status),
            });
        }
        let next_synced = self.image_synced || patch.mark_synced;
        if next_synced && next_status < ProcessingStatus::Processed {
            return Err(CoordError::InvalidTransition {
                id: self.id.clone(),
                reason: format!("cannot mark synced while {}", next_status),
            });
        }

        if next_status != self.processing_status {
            match next_status {
                ProcessingStatus::Processing => {
                    self.claimed_at = Some(now);
                    self.claim_attempts += 1;
                }
                ProcessingStatus::Processed => {
                    self.processed_at.get_or_insert(now);
                }
                ProcessingStatus::Transmitted => {
                    self.processed_at.get_or_insert(now);
                    self.transmitted_at.get_or_insert(now);
                }
                ProcessingStatus::Pending => {}
            }
            self.processing_status = next_status;
        }
        self.image_synced = next_synced;

        if let Some(filename) = &patch.filename {
            self.filename = Some(filename.clone());
        }
        if patch.clear_local_path {
            self.local_path = None;
        } else if let Some(path) = &patch.local_path {
            self.local_path = Some(path.clone());
        }
        if let Some(remote) = &patch.remote_ref {
            self.remote_ref = Some(remote.clone());
        }
        if let Some(err) = &patch.processing_error {
            self.processing_error = Some(err.clone());
        }
        if patch.compression_attempted {
            self.compression_attempted = true;
        }
        Ok(())
    }
}

/// Field changes committed together with (or without) a status transition.
///
/// Flags only ever set things; there is no way to unset
/// `image_synced` or `compression_attempted`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub status: Option<ProcessingStatus>,
    pub filename: Option<String>,
    pub local_path: Option<PathBuf>,
    pub clear_local_path: bool,
    pub remote_ref: Option<String>,
    pub mark_synced: bool,
    pub processing_error: Option<String>,
    pub compression_attempted: bool,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProcessingStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Rename the artifact, e.g. after re-encoding it under a new extension.
    pub fn artifact(mut self, local_path: impl Into<PathBuf>) -> Self {
        let local_path = local_path.into();
        self.filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.local_path = Some(local_path);
        self
    }

    pub fn clear_local_path(mut self) -> Self {
        self.clear_local_path = true;
        self
    }

    pub fn synced(mut self, remote_ref: impl Into<String>) -> Self {
        self.mark_synced = true;
        self.remote_ref = Some(remote_ref.into());
        self
    }

    pub fn processing_error(mut self, msg: impl Into<String>) -> Self {
        self.processing_error = Some(msg.into());
        self
    }

    pub fn compression_attempted(mut self) -> Self {
        self.compression_attempted = true;
        self
    }
}
