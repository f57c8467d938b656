// # Common Types
//
// Shared identifiers and small helpers used across the coordinator and
// worker sides. Kept deliberately thin; anything with behavior lives in
// its own module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Identifier of a user query, assigned by the metadata store.
pub type QueryId = u64;

/// Identifier of a chunk (horizontal table partition).
pub type ChunkId = i32;

/// Identifier of a job (one chunk-scoped fragment execution), unique within a query.
pub type JobId = u64;

/// Identifier of a bundle, an ordinal unique within its query.
pub type BundleId = u64;

/// Identifier of a coordinator instance, assigned by the metadata store.
pub type CoordinatorId = u64;

/// Stable worker identifier; survives worker restarts.
pub type WorkerId = String;

/// Milliseconds since the Unix epoch.
pub fn millis_since_epoch() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Process-wide HTTP client; cloning shares the underlying pool.
pub fn http_client() -> reqwest::Client {
    HTTP_CLIENT.clone()
}

/// Advisory cancellation flag shared between an owner and its workers.
///
/// Cancellation is idempotent and absorbing: once raised the flag never
/// clears. In-flight operations check it at their natural suspension points.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Scan profile attached to a bundle: a priority hint plus the tables the
/// scan will touch. Interactive scans preempt batch scans on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Higher values schedule ahead of lower ones.
    pub priority: i32,
    /// (db, table) pairs the scan reads.
    pub tables: Vec<ScanTable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTable {
    pub db: String,
    pub table: String,
    /// Relative cost of scanning this table; feeds the worker's ordering.
    #[serde(default)]
    pub scan_rating: i32,
    #[serde(default)]
    pub lock_in_memory: bool,
}

impl ScanInfo {
    pub fn batch() -> Self {
        Self {
            priority: 0,
            tables: Vec::new(),
        }
    }

    pub fn interactive() -> Self {
        Self {
            priority: 100,
            tables: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_absorbing() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        flag.cancel();
        assert!(flag.is_cancelled());
    }
}
