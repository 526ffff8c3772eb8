//! Coordination configuration from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoordError, Result};
use crate::eviction::EvictionManager;
use crate::ledger::ResultsLedger;
use crate::manifest::ManifestRepository;
use crate::status::ServiceRegistry;
use crate::sync::SyncTransfer;
use crate::worker::StalePolicy;

/// Settings shared by every worker role.
///
/// Loaded from environment variables with defaults; binaries call `dotenv`
/// first so a `.env` file next to the data directory works too.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Directory holding the manifest and status files
    pub data_dir: PathBuf,

    pub manifest_file: String,

    /// Directory holding the results ledger and its rotations
    pub results_dir: PathBuf,

    pub results_file: String,

    /// Service heartbeat file, relative to `data_dir`
    pub status_file: String,

    pub lock_timeout_ms: u64,

    /// Idle sleep between polls
    pub poll_interval_ms: u64,

    pub claim_batch: usize,

    /// Local artifact ring buffer size (0 disables eviction)
    pub buffer_size: usize,

    pub sync_enabled: bool,

    /// Remote directory the sync agent writes to
    pub remote_dir: Option<PathBuf>,

    /// Remove local artifacts right after they are synced
    pub sync_remove_local: bool,

    /// Age after which a `processing` claim is considered abandoned (0 disables)
    pub stale_claim_secs: u64,

    pub max_claim_attempts: u32,

    pub ledger_max_size_mb: u64,

    pub ledger_max_rotations: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CoreConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `COORD_DATA_DIR` (default: data)
    /// - `COORD_MANIFEST_FILE` (default: processing_manifest.json)
    /// - `COORD_RESULTS_DIR` (default: results)
    /// - `COORD_RESULTS_FILE` (default: results.jsonl)
    /// - `COORD_STATUS_FILE` (default: pipeline_status.json)
    /// - `COORD_LOCK_TIMEOUT_MS` (default: 10000)
    /// - `COORD_POLL_INTERVAL_MS` (default: 2000)
    /// - `COORD_CLAIM_BATCH` (default: 8)
    /// - `COORD_BUFFER_SIZE` (default: 0)
    /// - `COORD_SYNC_ENABLED` (default: false)
    /// - `COORD_REMOTE_DIR` (default: unset)
    /// - `COORD_SYNC_REMOVE_LOCAL` (default: false)
    /// - `COORD_STALE_CLAIM_SECS` (default: 0)
    /// - `COORD_MAX_CLAIM_ATTEMPTS` (default: 3)
    /// - `COORD_LEDGER_MAX_SIZE_MB` (default: 100)
    /// - `COORD_LEDGER_MAX_ROTATIONS` (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            data_dir: PathBuf::from(string("COORD_DATA_DIR", "data")),
            manifest_file: string("COORD_MANIFEST_FILE", "processing_manifest.json"),
            results_dir: PathBuf::from(string("COORD_RESULTS_DIR", "results")),
            results_file: string("COORD_RESULTS_FILE", "results.jsonl"),
            status_file: string("COORD_STATUS_FILE", "pipeline_status.json"),

            lock_timeout_ms: parse_or(&lookup, "COORD_LOCK_TIMEOUT_MS", 10_000),
            poll_interval_ms: parse_or(&lookup, "COORD_POLL_INTERVAL_MS", 2_000),
            claim_batch: parse_or(&lookup, "COORD_CLAIM_BATCH", 8),

            buffer_size: parse_or(&lookup, "COORD_BUFFER_SIZE", 0),
            sync_enabled: parse_or(&lookup, "COORD_SYNC_ENABLED", false),
            remote_dir: lookup("COORD_REMOTE_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            sync_remove_local: parse_or(&lookup, "COORD_SYNC_REMOVE_LOCAL", false),

            stale_claim_secs: parse_or(&lookup, "COORD_STALE_CLAIM_SECS", 0),
            max_claim_attempts: parse_or(&lookup, "COORD_MAX_CLAIM_ATTEMPTS", 3),

            ledger_max_size_mb: parse_or(&lookup, "COORD_LEDGER_MAX_SIZE_MB", 100),
            ledger_max_rotations: parse_or(&lookup, "COORD_LEDGER_MAX_ROTATIONS", 10),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(CoordError::Config("COORD_LOCK_TIMEOUT_MS must be > 0".into()));
        }
        if self.claim_batch == 0 {
            return Err(CoordError::Config("COORD_CLAIM_BATCH must be > 0".into()));
        }
        if self.sync_enabled && self.remote_dir.is_none() {
            return Err(CoordError::Config(
                "COORD_SYNC_ENABLED=true requires COORD_REMOTE_DIR".into(),
            ));
        }
        if self.max_claim_attempts == 0 {
            return Err(CoordError::Config("COORD_MAX_CLAIM_ATTEMPTS must be > 0".into()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(&self.manifest_file)
    }

    pub fn results_path(&self) -> PathBuf {
        self.results_dir.join(&self.results_file)
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(&self.status_file)
    }

    pub fn sync_transfer(&self) -> SyncTransfer {
        if self.sync_remove_local {
            SyncTransfer::Move
        } else {
            SyncTransfer::Copy
        }
    }

    pub fn stale_policy(&self) -> Option<StalePolicy> {
        StalePolicy::from_threshold(Duration::from_secs(self.stale_claim_secs), self.max_claim_attempts)
    }

    pub fn manifest(&self) -> ManifestRepository {
        ManifestRepository::new(self.manifest_path(), self.lock_timeout())
    }

    pub fn ledger(&self) -> ResultsLedger {
        ResultsLedger::new(
            self.results_path(),
            self.lock_timeout(),
            self.ledger_max_size_mb,
            self.ledger_max_rotations,
        )
    }

    pub fn services(&self) -> ServiceRegistry {
        ServiceRegistry::new(self.status_path(), self.lock_timeout())
    }

    pub fn eviction(&self) -> EvictionManager {
        EvictionManager::new(self.manifest(), self.buffer_size, self.sync_enabled)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> CoreConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CoreConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]);

        assert_eq!(config.manifest_path(), PathBuf::from("data/processing_manifest.json"));
        assert_eq!(config.results_path(), PathBuf::from("results/results.jsonl"));
        assert_eq!(config.status_path(), PathBuf::from("data/pipeline_status.json"));
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.claim_batch, 8);
        assert_eq!(config.buffer_size, 0);
        assert!(!config.sync_enabled);
        assert!(config.remote_dir.is_none());
        assert!(config.stale_policy().is_none());
        assert_eq!(config.sync_transfer(), SyncTransfer::Copy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        let config = config_from(&[
            ("COORD_DATA_DIR", "/srv/capture"),
            ("COORD_LOCK_TIMEOUT_MS", "2500"),
            ("COORD_BUFFER_SIZE", "50"),
            ("COORD_SYNC_ENABLED", "true"),
            ("COORD_REMOTE_DIR", "/mnt/share"),
            ("COORD_SYNC_REMOVE_LOCAL", "true"),
            ("COORD_STALE_CLAIM_SECS", "600"),
        ]);

        assert_eq!(config.manifest_path(), PathBuf::from("/srv/capture/processing_manifest.json"));
        assert_eq!(config.lock_timeout(), Duration::from_millis(2500));
        assert_eq!(config.buffer_size, 50);
        assert!(config.sync_enabled);
        assert_eq!(config.remote_dir, Some(PathBuf::from("/mnt/share")));
        assert_eq!(config.sync_transfer(), SyncTransfer::Move);
        let policy = config.stale_policy().unwrap();
        assert_eq!(policy.older_than, Duration::from_secs(600));
        assert_eq!(policy.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = config_from(&[("COORD_CLAIM_BATCH", "lots"), ("COORD_SYNC_ENABLED", "yes")]);
        assert_eq!(config.claim_batch, 8);
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_validate_rejects_inconsistent_settings() {
        let sync_without_remote = config_from(&[("COORD_SYNC_ENABLED", "true")]);
        assert!(matches!(sync_without_remote.validate(), Err(CoordError::Config(_))));

        let zero_timeout = config_from(&[("COORD_LOCK_TIMEOUT_MS", "0")]);
        assert!(matches!(zero_timeout.validate(), Err(CoordError::Config(_))));

        let zero_batch = config_from(&[("COORD_CLAIM_BATCH", "0")]);
        assert!(zero_batch.validate().is_err());
    }
}
