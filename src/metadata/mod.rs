// # Metadata Service
//
// Persistent journal of coordinators, queries, table usage, messages, chunk
// placement, and progress, used by the coordinator to survive restarts.
// All state-changing operations are transactional; `complete_query` and
// `finish_query` must update exactly one row, and a divergent count is a
// consistency error.

pub mod mem;
pub mod messages;
pub mod store;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{ChunkId, CoordinatorId, QueryId, WorkerId};
use crate::error::{CoreError, Result};

pub use mem::MemMetadataStore;
pub use messages::MessageStore;
pub use store::SqlMetadataStore;

/// Value of the `version` metadata row this code expects.
pub const SCHEMA_VERSION: &str = "12";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Executing,
    Completed,
    Failed,
    FailedRowcap,
    Aborted,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Executing => "EXECUTING",
            QueryStatus::Completed => "COMPLETED",
            QueryStatus::Failed => "FAILED",
            QueryStatus::FailedRowcap => "FAILED_ROWCAP",
            QueryStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "EXECUTING" => Ok(QueryStatus::Executing),
            "COMPLETED" => Ok(QueryStatus::Completed),
            "FAILED" => Ok(QueryStatus::Failed),
            "FAILED_ROWCAP" => Ok(QueryStatus::FailedRowcap),
            "ABORTED" => Ok(QueryStatus::Aborted),
            other => Err(CoreError::Internal(format!(
                "unknown query status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Executing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
        }
    }
}

/// One entry in a query's message journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub query_id: QueryId,
    /// -1 when the message is not chunk-specific.
    pub chunk_id: ChunkId,
    pub code: i32,
    pub severity: Severity,
    pub text: String,
    pub timestamp_ms: u64,
}

/// Attributes of a query being journalled at acceptance.
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub coordinator_id: CoordinatorId,
    pub user: String,
    /// Submitted SQL text.
    pub query: String,
    /// Rewritten per-chunk template.
    pub chunk_template: String,
    /// Merge-phase SQL.
    pub merge_sql: String,
    /// Result table name, possibly containing a `#QID#` token.
    pub result_location: String,
    pub message_table: String,
    pub chunk_count: u32,
    /// (db, table) pairs the query touches, for the impact index.
    pub tables: Vec<(String, String)>,
}

/// A journalled query row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: QueryId,
    pub coordinator_id: CoordinatorId,
    pub user: String,
    pub query: String,
    pub chunk_template: String,
    pub merge_sql: String,
    pub result_location: String,
    pub message_table: String,
    pub chunk_count: u32,
    pub status: QueryStatus,
    pub submitted_ms: u64,
    pub completed_ms: Option<u64>,
    pub returned_ms: Option<u64>,
    pub collected_rows: u64,
    pub collected_bytes: u64,
    pub final_rows: Option<u64>,
}

impl QueryRecord {
    /// The concrete result table name, `#QID#` expanded.
    pub fn result_table(&self) -> String {
        self.result_location
            .replace("#QID#", &self.query_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProgress {
    pub query_id: QueryId,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub updated_ms: u64,
}

/// The persistent metadata surface used by the coordinator.
#[async_trait]
pub trait QueryMetadata: Send + Sync {
    /// Register a coordinator by name, reactivating an existing row.
    /// Returns the stable coordinator id.
    async fn register_coordinator(&self, name: &str) -> Result<CoordinatorId>;

    async fn set_coordinator_active(&self, id: CoordinatorId, active: bool) -> Result<()>;

    /// Journal a new query in EXECUTING and index its tables.
    async fn add_query(&self, q: NewQuery) -> Result<QueryId>;

    /// Record a terminal status and collection totals. Must update exactly
    /// one row.
    async fn complete_query(
        &self,
        query_id: QueryId,
        status: QueryStatus,
        collected_rows: u64,
        collected_bytes: u64,
        final_rows: Option<u64>,
    ) -> Result<()>;

    /// Stamp the time the result was returned to the user. Must update
    /// exactly one row.
    async fn finish_query(&self, query_id: QueryId) -> Result<()>;

    /// Replace the recorded user-facing result query (used when the row cap
    /// rewrites the final SELECT).
    async fn update_result_query(&self, query_id: QueryId, result_query: &str) -> Result<()>;

    async fn query_record(&self, query_id: QueryId) -> Result<QueryRecord>;

    /// Ids of executing queries touching `db`.`table`.
    async fn queries_at_table(&self, db: &str, table: &str) -> Result<Vec<QueryId>>;

    /// Start-up recovery: abort every query still EXECUTING under
    /// `coordinator_id`, stamping completion now. Returns the count.
    async fn abort_executing_queries(&self, coordinator_id: CoordinatorId) -> Result<u64>;

    async fn add_message(&self, msg: &QueryMessage) -> Result<()>;

    async fn messages(&self, query_id: QueryId) -> Result<Vec<QueryMessage>>;

    /// The chunk-placement table. Readers may cache it and reread only when
    /// [`placement_update_time`](Self::placement_update_time) advances.
    async fn chunk_placement(&self) -> Result<HashMap<ChunkId, WorkerId>>;

    async fn placement_update_time(&self) -> Result<u64>;

    async fn save_progress(&self, query_id: QueryId, completed_chunks: u32) -> Result<()>;

    async fn progress(&self, query_id: QueryId) -> Result<Option<QueryProgress>>;

    /// Completed queries whose completion time falls inside
    /// `[older_than_ms, newer_than_ms)` windows for the retention sweeps.
    async fn completed_between(
        &self,
        completed_before_ms: u64,
        completed_after_ms: u64,
    ) -> Result<Vec<QueryRecord>>;

    /// Drop a query's journal entries once its result table is reclaimed.
    async fn reap_query(&self, query_id: QueryId) -> Result<()>;

    /// Run a caller-provided read-only SELECT against the metadata tables.
    async fn metadata_select(&self, sql: &str) -> Result<crate::sql::SqlResults>;
}
