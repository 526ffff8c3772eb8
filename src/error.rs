//! Error taxonomy shared by every coordination component.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::manifest::{EntryId, ProcessingStatus};

pub type Result<T> = std::result::Result<T, CoordError>;

/// Which shared file a `CorruptState` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// The processing manifest, the system of record.
    Manifest,
    /// The results ledger or one of its rotations.
    Ledger,
    /// The service heartbeat file.
    Status,
    /// Any other lock-protected document.
    Document,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Manifest => "manifest",
            StateKind::Ledger => "ledger",
            StateKind::Status => "status file",
            StateKind::Document => "state",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("corrupt {kind} {}: {reason}", path.display())]
    CorruptState {
        kind: StateKind,
        path: PathBuf,
        reason: String,
    },

    #[error("entry {0} already exists")]
    DuplicateId(EntryId),

    #[error("entry {id} is {found}, expected {expected}")]
    StaleState {
        id: EntryId,
        expected: String,
        found: ProcessingStatus,
    },

    #[error("entry {0} not found")]
    NotFound(EntryId),

    #[error("invalid transition for entry {id}: {reason}")]
    InvalidTransition { id: EntryId, reason: String },

    #[error("transfer of {object} failed: {source}")]
    Transfer {
        object: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration value: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CoordError {
    /// Errors a caller should retry on a later cycle rather than surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::LockTimeout { .. } | CoordError::Transfer { .. } | CoordError::StaleState { .. }
        )
    }

    /// Only an unreadable manifest ends a worker. A damaged ledger or status
    /// file fails the operation that touched it and nothing more.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordError::CorruptState {
                kind: StateKind::Manifest,
                ..
            }
        )
    }

    pub(crate) fn corrupt(kind: StateKind, path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CoordError::CorruptState {
            kind,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let timeout = CoordError::LockTimeout {
            path: PathBuf::from("m.json"),
            waited: Duration::from_millis(5),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_fatal());

        let corrupt = CoordError::corrupt(StateKind::Manifest, "m.json", "expected value at line 1");
        assert!(corrupt.is_fatal());
        assert!(!corrupt.is_transient());

        for kind in [StateKind::Ledger, StateKind::Status, StateKind::Document] {
            let other = CoordError::corrupt(kind, "x.json", "expected value at line 1");
            assert!(!other.is_fatal(), "{} corruption must not end the worker", kind);
        }

        let dup = CoordError::DuplicateId(EntryId::from("a"));
        assert!(!dup.is_transient());
        assert_eq!(dup.to_string(), "entry a already exists");
    }
}
