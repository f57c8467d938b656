// # Configuration
//
// Plain config structs with explicit defaults, one per subsystem. Interval
// and retention values below their floors are clamped rather than rejected
// so that a bad value degrades to a safe one instead of taking the process
// down mid-flight. Fatal misconfiguration (unreadable file, missing result
// directory with creation disabled) is surfaced at init and exits non-zero.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Liveness and status-exchange tuning for one side of the peer protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Seconds between status-exchange round-trips.
    pub status_interval_secs: u64,
    /// A peer is DEAD once this long has passed without a successful round-trip.
    pub dead_after_secs: u64,
    /// Maximum lifetime of an entry in the peer notice maps before compaction
    /// drops it.
    pub entry_max_lifetime_secs: u64,
    /// Hard deadline on any coordinator<->worker HTTP request.
    pub http_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 15,
            dead_after_secs: 60,
            entry_max_lifetime_secs: 300,
            http_timeout_secs: 60,
        }
    }
}

impl PeerConfig {
    pub fn clamped(mut self) -> Self {
        self.status_interval_secs = self.status_interval_secs.max(1);
        self.dead_after_secs = self.dead_after_secs.max(2 * self.status_interval_secs);
        self.entry_max_lifetime_secs = self.entry_max_lifetime_secs.max(self.dead_after_secs);
        self.http_timeout_secs = self.http_timeout_secs.max(1);
        self
    }
}

/// Result-merge tuning on the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Total concurrent result-file pulls.
    pub pool_size: usize,
    /// Concurrent pulls against a single worker.
    pub per_worker_pulls: usize,
    /// HTTP retries per file before the bundle is failed.
    pub retry_limit: u32,
    /// First retry backoff in milliseconds; doubled per attempt.
    pub backoff_base_ms: u64,
    /// Ceiling on the retry backoff.
    pub backoff_max_ms: u64,
    /// Rows inserted into the merge table per statement.
    pub insert_batch_rows: usize,
    /// Deadline on one result-file pull; file pulls are long-lived and not
    /// bound by the control-message timeout.
    pub pull_timeout_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            per_worker_pulls: 4,
            retry_limit: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
            insert_batch_rows: 500,
            pull_timeout_secs: 600,
        }
    }
}

impl MergeConfig {
    pub fn clamped(mut self) -> Self {
        self.pool_size = self.pool_size.max(1);
        self.per_worker_pulls = self.per_worker_pulls.clamp(1, self.pool_size);
        self.backoff_base_ms = self.backoff_base_ms.max(10);
        self.backoff_max_ms = self.backoff_max_ms.max(self.backoff_base_ms);
        self.insert_batch_rows = self.insert_batch_rows.max(1);
        self.pull_timeout_secs = self.pull_timeout_secs.max(1);
        self
    }
}

/// Retention thresholds for the garbage-collection sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Completed async queries older than this have their result and message
    /// tables dropped.
    pub async_retention_secs: u64,
    /// Any table in the result database older than this is dropped regardless
    /// of association. The result database must be a dedicated schema.
    pub hard_retention_secs: u64,
    /// Worker result files older than this are reclaimed.
    pub worker_file_retention_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            async_retention_secs: 3600,
            hard_retention_secs: 86_400,
            worker_file_retention_secs: 86_400,
        }
    }
}

impl RetentionConfig {
    // Floors keep a fat-fingered config from turning the sweeps into a
    // busy-loop that drops live tables.
    pub fn clamped(mut self) -> Self {
        self.async_retention_secs = self.async_retention_secs.max(60);
        self.hard_retention_secs = self.hard_retention_secs.max(self.async_retention_secs);
        self.worker_file_retention_secs = self.worker_file_retention_secs.max(60);
        self
    }
}

/// Coordinator process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Stable coordinator name, registered in the metadata store.
    pub name: String,
    /// Host published to workers for callbacks.
    pub host: String,
    /// HTTP port for worker callbacks and operational endpoints.
    pub port: u16,
    /// Deployment instance id carried in every request envelope.
    pub instance_id: String,
    /// Shared authentication key.
    pub auth_key: String,
    /// Elevated key for administrative requests.
    pub admin_auth_key: String,
    /// URI of the metadata database.
    pub metadata_uri: String,
    /// URI of the dedicated result database.
    pub result_db_uri: String,
    /// Name of the dedicated result schema swept by hard retention.
    pub result_db: String,
    /// Maximum jobs per bundle; a worker's job set is split beyond this.
    pub bundle_max_jobs: usize,
    /// Attempt limit M per job; exceeding it fails the query.
    pub job_attempt_limit: u32,
    /// Configuration hook: retry jobs after worker execution errors.
    /// Off by default.
    pub retry_execution_errors: bool,
    pub peer: PeerConfig,
    pub merge: MergeConfig,
    pub retention: RetentionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "coordinator".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7080,
            instance_id: "scatterdb".to_string(),
            auth_key: String::new(),
            admin_auth_key: String::new(),
            metadata_uri: "mock://metadata".to_string(),
            result_db_uri: "mock://results".to_string(),
            result_db: "scatter_results".to_string(),
            bundle_max_jobs: 1000,
            job_attempt_limit: 5,
            retry_execution_errors: false,
            peer: PeerConfig::default(),
            merge: MergeConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn clamped(mut self) -> Self {
        self.bundle_max_jobs = self.bundle_max_jobs.max(1);
        self.job_attempt_limit = self.job_attempt_limit.max(1);
        self.peer = self.peer.clamped();
        self.merge = self.merge.clamped();
        self.retention = self.retention.clamped();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CoreError::Config("coordinator name must not be empty".into()));
        }
        if self.result_db.is_empty() {
            return Err(CoreError::Config("result_db must name a dedicated schema".into()));
        }
        Ok(())
    }
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable worker id; survives restarts.
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub instance_id: String,
    pub auth_key: String,
    /// URI of the local MySQL instance holding this worker's chunks.
    pub mysql_uri: String,
    /// Directory result files are written to and served from.
    pub result_dir: String,
    /// Create `result_dir` at startup if missing.
    pub create_result_dir: bool,
    /// Concurrent task executions.
    pub task_pool_size: usize,
    pub peer: PeerConfig,
    pub retention: RetentionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-0".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7090,
            instance_id: "scatterdb".to_string(),
            auth_key: String::new(),
            mysql_uri: "mock://chunks".to_string(),
            result_dir: "./results".to_string(),
            create_result_dir: true,
            task_pool_size: num_cpus::get().max(2),
            peer: PeerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn clamped(mut self) -> Self {
        self.task_pool_size = self.task_pool_size.max(1);
        self.peer = self.peer.clamped();
        self.retention = self.retention.clamped();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(CoreError::Config("worker_id must not be empty".into()));
        }
        if !self.create_result_dir && !Path::new(&self.result_dir).is_dir() {
            return Err(CoreError::Config(format!(
                "result directory {} missing and creation disabled",
                self.result_dir
            )));
        }
        Ok(())
    }
}

/// Load a JSON config file, falling back to `T::default()` when the file
/// does not exist. A present-but-unreadable file is a fatal init error.
pub fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let text = fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| CoreError::Config(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_are_enforced() {
        let peer = PeerConfig {
            status_interval_secs: 0,
            dead_after_secs: 0,
            entry_max_lifetime_secs: 0,
            http_timeout_secs: 0,
        }
        .clamped();
        assert!(peer.status_interval_secs >= 1);
        assert!(peer.dead_after_secs >= 2 * peer.status_interval_secs);
        assert!(peer.entry_max_lifetime_secs >= peer.dead_after_secs);

        let ret = RetentionConfig {
            async_retention_secs: 1,
            hard_retention_secs: 1,
            worker_file_retention_secs: 1,
        }
        .clamped();
        assert!(ret.hard_retention_secs >= ret.async_retention_secs);
    }

    #[test]
    fn merge_pulls_capped_by_pool() {
        let merge = MergeConfig {
            pool_size: 2,
            per_worker_pulls: 10,
            ..MergeConfig::default()
        }
        .clamped();
        assert_eq!(merge.per_worker_pulls, 2);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let cfg: CoordinatorConfig =
            load_or_default(Path::new("/nonexistent/scatterdb.json")).unwrap();
        assert_eq!(cfg.job_attempt_limit, 5);
    }
}
