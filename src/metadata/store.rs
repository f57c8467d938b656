// SQL-backed metadata store.
//
// Table layout:
//   QCoordinator (coordinatorId, name, active)
//   QInfo        (queryId, coordinatorId, user, query, qTemplate, qMerge,
//                 resultLocation, messageTable, chunkCount, status,
//                 submitted, completed, returned, collectedRows,
//                 collectedBytes, finalRows)
//   QTable       (queryId, dbName, tblName)
//   QMessages    (queryId, chunkId, code, severity, message, timestamp)
//   QChunkMap    (chunk, worker)
//   QChunkMapStatus (updateTime)
//   QProgress    (queryId, completedChunks, totalChunks, updateTime)
//   QMetadata    (metakey, value)
//
// Short statements are serialised under a single mutex; the lock is never
// held across anything but the statement itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    NewQuery, QueryMetadata, QueryMessage, QueryProgress, QueryRecord, QueryStatus, Severity,
    SCHEMA_VERSION,
};
use crate::common::{millis_since_epoch, ChunkId, CoordinatorId, QueryId, WorkerId};
use crate::error::{CoreError, Result};
use crate::sql::{escape_string, SqlConnection, SqlResults};

pub struct SqlMetadataStore {
    conn: Arc<dyn SqlConnection>,
    // Serialises short statements; never held across callbacks.
    stmt_lock: Mutex<()>,
}

impl SqlMetadataStore {
    /// Open the store and verify the schema version. A mismatch is fatal.
    pub async fn open(conn: Arc<dyn SqlConnection>) -> Result<Self> {
        let store = Self {
            conn,
            stmt_lock: Mutex::new(()),
        };
        store.check_schema_version().await?;
        Ok(store)
    }

    /// Open without the version check, for bootstrap paths that create the
    /// schema first.
    pub fn open_unchecked(conn: Arc<dyn SqlConnection>) -> Self {
        Self {
            conn,
            stmt_lock: Mutex::new(()),
        }
    }

    async fn check_schema_version(&self) -> Result<()> {
        let results = self
            .query("SELECT value FROM QMetadata WHERE metakey = 'version'")
            .await?;
        let found = results
            .scalar()
            .map_err(|_| CoreError::Config("metadata schema version row missing".to_string()))?
            .unwrap_or("")
            .to_string();
        if found != SCHEMA_VERSION {
            return Err(CoreError::Config(format!(
                "metadata schema version mismatch: found '{}', need '{}'",
                found, SCHEMA_VERSION
            )));
        }
        info!(version = %found, "metadata schema verified");
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let _guard = self.stmt_lock.lock().await;
        self.conn.execute(sql).await
    }

    async fn query(&self, sql: &str) -> Result<SqlResults> {
        let _guard = self.stmt_lock.lock().await;
        self.conn.query(sql).await
    }

    /// Enforce the exactly-one-row contract of completion updates.
    async fn execute_single_row(&self, sql: &str, what: &str, query_id: QueryId) -> Result<()> {
        let affected = self.execute(sql).await?;
        if affected != 1 {
            return Err(CoreError::Internal(format!(
                "{} for query {} updated {} rows, expected 1",
                what, query_id, affected
            )));
        }
        Ok(())
    }
}

fn cell(results: &SqlResults, row: usize, col: usize) -> Option<String> {
    results.rows.get(row).and_then(|r| r.0.get(col)).cloned().flatten()
}

fn parse_u64(value: Option<String>, what: &str) -> Result<u64> {
    value
        .ok_or_else(|| CoreError::Internal(format!("NULL {}", what)))?
        .parse()
        .map_err(|e| CoreError::Internal(format!("bad {}: {}", what, e)))
}

fn parse_opt_u64(value: Option<String>, what: &str) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|e| CoreError::Internal(format!("bad {}: {}", what, e))),
    }
}

#[async_trait]
impl QueryMetadata for SqlMetadataStore {
    async fn register_coordinator(&self, name: &str) -> Result<CoordinatorId> {
        let name_esc = escape_string(name);
        let existing = self
            .query(&format!(
                "SELECT coordinatorId FROM QCoordinator WHERE name = '{}'",
                name_esc
            ))
            .await?;
        if let Some(id) = cell(&existing, 0, 0) {
            let id: CoordinatorId = id
                .parse()
                .map_err(|e| CoreError::Internal(format!("bad coordinatorId: {}", e)))?;
            self.execute(&format!(
                "UPDATE QCoordinator SET active = 1 WHERE coordinatorId = {}",
                id
            ))
            .await?;
            return Ok(id);
        }
        self.execute(&format!(
            "INSERT INTO QCoordinator (name, active) VALUES ('{}', 1)",
            name_esc
        ))
        .await?;
        self.conn.last_insert_id().await
    }

    async fn set_coordinator_active(&self, id: CoordinatorId, active: bool) -> Result<()> {
        self.execute(&format!(
            "UPDATE QCoordinator SET active = {} WHERE coordinatorId = {}",
            if active { 1 } else { 0 },
            id
        ))
        .await?;
        Ok(())
    }

    async fn add_query(&self, q: NewQuery) -> Result<QueryId> {
        let now = millis_since_epoch();
        let insert = format!(
            "INSERT INTO QInfo (coordinatorId, user, query, qTemplate, qMerge, \
             resultLocation, messageTable, chunkCount, status, submitted, \
             collectedRows, collectedBytes) VALUES ({}, '{}', '{}', '{}', '{}', \
             '{}', '{}', {}, 'EXECUTING', {}, 0, 0)",
            q.coordinator_id,
            escape_string(&q.user),
            escape_string(&q.query),
            escape_string(&q.chunk_template),
            escape_string(&q.merge_sql),
            escape_string(&q.result_location),
            escape_string(&q.message_table),
            q.chunk_count,
            now,
        );
        {
            let _guard = self.stmt_lock.lock().await;
            self.conn.execute(&insert).await?;
        }
        let query_id = self.conn.last_insert_id().await?;

        let table_inserts: Vec<String> = q
            .tables
            .iter()
            .map(|(db, tbl)| {
                format!(
                    "INSERT INTO QTable (queryId, dbName, tblName) VALUES ({}, '{}', '{}')",
                    query_id,
                    escape_string(db),
                    escape_string(tbl)
                )
            })
            .collect();
        if !table_inserts.is_empty() {
            let _guard = self.stmt_lock.lock().await;
            self.conn.execute_transaction(&table_inserts).await?;
        }
        Ok(query_id)
    }

    async fn complete_query(
        &self,
        query_id: QueryId,
        status: QueryStatus,
        collected_rows: u64,
        collected_bytes: u64,
        final_rows: Option<u64>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE QInfo SET completed = {}, status = '{}', collectedRows = {}, \
             collectedBytes = {}, finalRows = {} WHERE queryId = {}",
            millis_since_epoch(),
            status.as_str(),
            collected_rows,
            collected_bytes,
            final_rows
                .map(|v| v.to_string())
                .unwrap_or_else(|| "NULL".to_string()),
            query_id,
        );
        self.execute_single_row(&sql, "completeQuery", query_id).await
    }

    async fn finish_query(&self, query_id: QueryId) -> Result<()> {
        let sql = format!(
            "UPDATE QInfo SET returned = {} WHERE queryId = {}",
            millis_since_epoch(),
            query_id
        );
        self.execute_single_row(&sql, "finishQuery", query_id).await
    }

    async fn update_result_query(&self, query_id: QueryId, result_query: &str) -> Result<()> {
        self.execute(&format!(
            "UPDATE QInfo SET resultQuery = '{}' WHERE queryId = {}",
            escape_string(result_query),
            query_id
        ))
        .await?;
        Ok(())
    }

    async fn query_record(&self, query_id: QueryId) -> Result<QueryRecord> {
        let results = self
            .query(&format!(
                "SELECT queryId, coordinatorId, user, query, qTemplate, qMerge, \
                 resultLocation, messageTable, chunkCount, status, submitted, \
                 completed, returned, collectedRows, collectedBytes, finalRows \
                 FROM QInfo WHERE queryId = {}",
                query_id
            ))
            .await?;
        if results.rows.is_empty() {
            return Err(CoreError::Internal(format!(
                "query {} not found in metadata",
                query_id
            )));
        }
        let status_str =
            cell(&results, 0, 9).ok_or_else(|| CoreError::Internal("NULL status".into()))?;
        Ok(QueryRecord {
            query_id: parse_u64(cell(&results, 0, 0), "queryId")?,
            coordinator_id: parse_u64(cell(&results, 0, 1), "coordinatorId")?,
            user: cell(&results, 0, 2).unwrap_or_default(),
            query: cell(&results, 0, 3).unwrap_or_default(),
            chunk_template: cell(&results, 0, 4).unwrap_or_default(),
            merge_sql: cell(&results, 0, 5).unwrap_or_default(),
            result_location: cell(&results, 0, 6).unwrap_or_default(),
            message_table: cell(&results, 0, 7).unwrap_or_default(),
            chunk_count: parse_u64(cell(&results, 0, 8), "chunkCount")? as u32,
            status: QueryStatus::parse(&status_str)?,
            submitted_ms: parse_u64(cell(&results, 0, 10), "submitted")?,
            completed_ms: parse_opt_u64(cell(&results, 0, 11), "completed")?,
            returned_ms: parse_opt_u64(cell(&results, 0, 12), "returned")?,
            collected_rows: parse_u64(cell(&results, 0, 13), "collectedRows")?,
            collected_bytes: parse_u64(cell(&results, 0, 14), "collectedBytes")?,
            final_rows: parse_opt_u64(cell(&results, 0, 15), "finalRows")?,
        })
    }

    async fn queries_at_table(&self, db: &str, table: &str) -> Result<Vec<QueryId>> {
        let results = self
            .query(&format!(
                "SELECT QInfo.queryId FROM QInfo NATURAL JOIN QTable \
                 WHERE QTable.dbName = '{}' AND QTable.tblName = '{}' \
                 AND QInfo.status = 'EXECUTING'",
                escape_string(db),
                escape_string(table)
            ))
            .await?;
        results
            .rows
            .iter()
            .map(|r| parse_u64(r.0.first().cloned().flatten(), "queryId"))
            .collect()
    }

    async fn abort_executing_queries(&self, coordinator_id: CoordinatorId) -> Result<u64> {
        let count = self
            .execute(&format!(
                "UPDATE QInfo SET status = 'ABORTED', completed = {} \
                 WHERE coordinatorId = {} AND status = 'EXECUTING'",
                millis_since_epoch(),
                coordinator_id
            ))
            .await?;
        if count > 0 {
            warn!(coordinator_id, aborted = count, "recovered executing queries from prior run");
        }
        Ok(count)
    }

    async fn add_message(&self, msg: &QueryMessage) -> Result<()> {
        self.execute(&format!(
            "INSERT INTO QMessages (queryId, chunkId, code, severity, message, timestamp) \
             VALUES ({}, {}, {}, '{}', '{}', {})",
            msg.query_id,
            msg.chunk_id,
            msg.code,
            msg.severity.as_str(),
            escape_string(&msg.text),
            msg.timestamp_ms,
        ))
        .await?;
        Ok(())
    }

    async fn messages(&self, query_id: QueryId) -> Result<Vec<QueryMessage>> {
        let results = self
            .query(&format!(
                "SELECT queryId, chunkId, code, severity, message, timestamp \
                 FROM QMessages WHERE queryId = {} ORDER BY timestamp",
                query_id
            ))
            .await?;
        results
            .rows
            .iter()
            .map(|r| {
                let severity = match r.0.get(3).cloned().flatten().as_deref() {
                    Some("ERROR") => Severity::Error,
                    _ => Severity::Info,
                };
                Ok(QueryMessage {
                    query_id: parse_u64(r.0.first().cloned().flatten(), "queryId")?,
                    chunk_id: r
                        .0
                        .get(1)
                        .cloned()
                        .flatten()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(-1),
                    code: r
                        .0
                        .get(2)
                        .cloned()
                        .flatten()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    severity,
                    text: r.0.get(4).cloned().flatten().unwrap_or_default(),
                    timestamp_ms: parse_u64(r.0.get(5).cloned().flatten(), "timestamp")?,
                })
            })
            .collect()
    }

    async fn chunk_placement(&self) -> Result<HashMap<ChunkId, WorkerId>> {
        let results = self
            .query("SELECT `chunk`, `worker` FROM QChunkMap")
            .await?;
        let mut placement = HashMap::with_capacity(results.rows.len());
        for row in &results.rows {
            let chunk: ChunkId = row
                .0
                .first()
                .cloned()
                .flatten()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| CoreError::Internal("bad chunk id in QChunkMap".into()))?;
            let worker = row
                .0
                .get(1)
                .cloned()
                .flatten()
                .ok_or_else(|| CoreError::Internal("NULL worker in QChunkMap".into()))?;
            placement.insert(chunk, worker);
        }
        Ok(placement)
    }

    async fn placement_update_time(&self) -> Result<u64> {
        let results = self
            .query("SELECT updateTime FROM QChunkMapStatus")
            .await?;
        parse_u64(cell(&results, 0, 0), "placement updateTime")
    }

    async fn save_progress(&self, query_id: QueryId, completed_chunks: u32) -> Result<()> {
        self.execute(&format!(
            "UPDATE QProgress SET completedChunks = {}, updateTime = {} WHERE queryId = {}",
            completed_chunks,
            millis_since_epoch(),
            query_id
        ))
        .await?;
        Ok(())
    }

    async fn progress(&self, query_id: QueryId) -> Result<Option<QueryProgress>> {
        let results = self
            .query(&format!(
                "SELECT completedChunks, totalChunks, updateTime FROM QProgress WHERE queryId = {}",
                query_id
            ))
            .await?;
        if results.rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(QueryProgress {
            query_id,
            completed_chunks: parse_u64(cell(&results, 0, 0), "completedChunks")? as u32,
            total_chunks: parse_u64(cell(&results, 0, 1), "totalChunks")? as u32,
            updated_ms: parse_u64(cell(&results, 0, 2), "updateTime")?,
        }))
    }

    async fn completed_between(
        &self,
        completed_before_ms: u64,
        completed_after_ms: u64,
    ) -> Result<Vec<QueryRecord>> {
        let results = self
            .query(&format!(
                "SELECT queryId FROM QInfo WHERE completed IS NOT NULL \
                 AND completed < {} AND completed >= {}",
                completed_before_ms, completed_after_ms
            ))
            .await?;
        let mut records = Vec::with_capacity(results.rows.len());
        for row in &results.rows {
            let qid = parse_u64(row.0.first().cloned().flatten(), "queryId")?;
            records.push(self.query_record(qid).await?);
        }
        Ok(records)
    }

    async fn reap_query(&self, query_id: QueryId) -> Result<()> {
        let stmts = vec![
            format!("DELETE FROM QMessages WHERE queryId = {}", query_id),
            format!("DELETE FROM QTable WHERE queryId = {}", query_id),
            format!("DELETE FROM QProgress WHERE queryId = {}", query_id),
            format!("DELETE FROM QInfo WHERE queryId = {}", query_id),
        ];
        let _guard = self.stmt_lock.lock().await;
        self.conn.execute_transaction(&stmts).await?;
        Ok(())
    }

    async fn metadata_select(&self, sql: &str) -> Result<SqlResults> {
        let trimmed = sql.trim_start().to_ascii_uppercase();
        if !trimmed.starts_with("SELECT") {
            return Err(CoreError::Config(
                "metadata_select accepts only SELECT statements".to_string(),
            ));
        }
        self.query(sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{MockSqlConnection, SqlRow};

    fn scalar(v: &str) -> SqlResults {
        SqlResults {
            columns: vec!["value".into()],
            rows: vec![SqlRow(vec![Some(v.into())])],
        }
    }

    #[tokio::test]
    async fn open_checks_schema_version() {
        let conn = MockSqlConnection::new();
        conn.push_result(scalar(SCHEMA_VERSION));
        assert!(SqlMetadataStore::open(Arc::new(conn)).await.is_ok());

        let conn = MockSqlConnection::new();
        conn.push_result(scalar("3"));
        let err = SqlMetadataStore::open(Arc::new(conn)).await.err().unwrap();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test]
    async fn add_query_journals_and_indexes_tables() {
        let conn = MockSqlConnection::new();
        let store = SqlMetadataStore::open_unchecked(Arc::new(conn.clone()));
        let qid = store
            .add_query(NewQuery {
                coordinator_id: 3,
                user: "ada".into(),
                query: "SELECT 1".into(),
                chunk_template: "SELECT * FROM sky.objects_{chunk}".into(),
                merge_sql: "INSERT INTO %RESULT% VALUES %ROWS%".into(),
                result_location: "result_#QID#".into(),
                message_table: "message_#QID#".into(),
                chunk_count: 3,
                tables: vec![("sky".into(), "objects".into())],
            })
            .await
            .unwrap();
        assert_eq!(qid, 1);
        assert!(conn.saw("INSERT INTO QInfo"));
        assert!(conn.saw("'EXECUTING'"));
        assert!(conn.saw("INSERT INTO QTable"));
    }

    #[tokio::test]
    async fn metadata_select_is_read_only() {
        let conn = MockSqlConnection::new();
        let store = SqlMetadataStore::open_unchecked(Arc::new(conn));
        assert!(store.metadata_select("DELETE FROM QInfo").await.is_err());
        assert!(store
            .metadata_select("SELECT queryId FROM QInfo")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn recovery_sweep_targets_prior_executing_rows() {
        let conn = MockSqlConnection::new();
        let store = SqlMetadataStore::open_unchecked(Arc::new(conn.clone()));
        store.abort_executing_queries(3).await.unwrap();
        assert!(conn.saw("SET status = 'ABORTED'"));
        assert!(conn.saw("status = 'EXECUTING'"));
        assert!(conn.saw("coordinatorId = 3"));
    }
}
