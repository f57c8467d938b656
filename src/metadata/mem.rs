// In-memory metadata store.
//
// Implements the same surface as the SQL-backed store against plain maps.
// Backs `mock://` bring-up and the integration tests; semantics (including
// the exactly-one-row completion contract) match the SQL store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    NewQuery, QueryMetadata, QueryMessage, QueryProgress, QueryRecord, QueryStatus,
};
use crate::common::{millis_since_epoch, ChunkId, CoordinatorId, QueryId, WorkerId};
use crate::error::{CoreError, Result};
use crate::sql::SqlResults;

#[derive(Default)]
struct MemState {
    coordinators: HashMap<String, (CoordinatorId, bool)>,
    next_coordinator_id: CoordinatorId,
    queries: HashMap<QueryId, QueryRecord>,
    next_query_id: QueryId,
    tables: Vec<(QueryId, String, String)>,
    messages: Vec<QueryMessage>,
    placement: HashMap<ChunkId, WorkerId>,
    placement_stamp: u64,
    progress: HashMap<QueryId, QueryProgress>,
    result_queries: HashMap<QueryId, String>,
}

#[derive(Default)]
pub struct MemMetadataStore {
    state: Mutex<MemState>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the chunk placement and advance the published stamp.
    pub fn set_placement(&self, placement: HashMap<ChunkId, WorkerId>) {
        let mut state = self.state.lock();
        state.placement = placement;
        state.placement_stamp += 1;
    }

    /// Seed a progress row; the SQL schema creates these with the query.
    pub fn seed_progress(&self, query_id: QueryId, total_chunks: u32) {
        self.state.lock().progress.insert(
            query_id,
            QueryProgress {
                query_id,
                completed_chunks: 0,
                total_chunks,
                updated_ms: millis_since_epoch(),
            },
        );
    }

    pub fn recorded_result_query(&self, query_id: QueryId) -> Option<String> {
        self.state.lock().result_queries.get(&query_id).cloned()
    }
}

#[async_trait]
impl QueryMetadata for MemMetadataStore {
    async fn register_coordinator(&self, name: &str) -> Result<CoordinatorId> {
        let mut state = self.state.lock();
        if let Some((id, active)) = state.coordinators.get_mut(name) {
            *active = true;
            return Ok(*id);
        }
        state.next_coordinator_id += 1;
        let id = state.next_coordinator_id;
        state.coordinators.insert(name.to_string(), (id, true));
        Ok(id)
    }

    async fn set_coordinator_active(&self, id: CoordinatorId, active: bool) -> Result<()> {
        let mut state = self.state.lock();
        for entry in state.coordinators.values_mut() {
            if entry.0 == id {
                entry.1 = active;
            }
        }
        Ok(())
    }

    async fn add_query(&self, q: NewQuery) -> Result<QueryId> {
        let mut state = self.state.lock();
        state.next_query_id += 1;
        let query_id = state.next_query_id;
        for (db, tbl) in &q.tables {
            state.tables.push((query_id, db.clone(), tbl.clone()));
        }
        state.queries.insert(
            query_id,
            QueryRecord {
                query_id,
                coordinator_id: q.coordinator_id,
                user: q.user,
                query: q.query,
                chunk_template: q.chunk_template,
                merge_sql: q.merge_sql,
                result_location: q.result_location,
                message_table: q.message_table,
                chunk_count: q.chunk_count,
                status: QueryStatus::Executing,
                submitted_ms: millis_since_epoch(),
                completed_ms: None,
                returned_ms: None,
                collected_rows: 0,
                collected_bytes: 0,
                final_rows: None,
            },
        );
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
        let mut state = self.state.lock();
        let record = state.queries.get_mut(&query_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "completeQuery for query {} updated 0 rows, expected 1",
                query_id
            ))
        })?;
        record.status = status;
        record.completed_ms = Some(millis_since_epoch());
        record.collected_rows = collected_rows;
        record.collected_bytes = collected_bytes;
        record.final_rows = final_rows;
        Ok(())
    }

    async fn finish_query(&self, query_id: QueryId) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.queries.get_mut(&query_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "finishQuery for query {} updated 0 rows, expected 1",
                query_id
            ))
        })?;
        record.returned_ms = Some(millis_since_epoch());
        Ok(())
    }

    async fn update_result_query(&self, query_id: QueryId, result_query: &str) -> Result<()> {
        self.state
            .lock()
            .result_queries
            .insert(query_id, result_query.to_string());
        Ok(())
    }

    async fn query_record(&self, query_id: QueryId) -> Result<QueryRecord> {
        self.state
            .lock()
            .queries
            .get(&query_id)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("query {} not found in metadata", query_id)))
    }

    async fn queries_at_table(&self, db: &str, table: &str) -> Result<Vec<QueryId>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .iter()
            .filter(|(qid, d, t)| {
                d == db
                    && t == table
                    && state
                        .queries
                        .get(qid)
                        .map(|q| q.status == QueryStatus::Executing)
                        .unwrap_or(false)
            })
            .map(|(qid, _, _)| *qid)
            .collect())
    }

    async fn abort_executing_queries(&self, coordinator_id: CoordinatorId) -> Result<u64> {
        let mut state = self.state.lock();
        let now = millis_since_epoch();
        let mut count = 0;
        for record in state.queries.values_mut() {
            if record.coordinator_id == coordinator_id && record.status == QueryStatus::Executing {
                record.status = QueryStatus::Aborted;
                record.completed_ms = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn add_message(&self, msg: &QueryMessage) -> Result<()> {
        self.state.lock().messages.push(msg.clone());
        Ok(())
    }

    async fn messages(&self, query_id: QueryId) -> Result<Vec<QueryMessage>> {
        Ok(self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| m.query_id == query_id)
            .cloned()
            .collect())
    }

    async fn chunk_placement(&self) -> Result<HashMap<ChunkId, WorkerId>> {
        Ok(self.state.lock().placement.clone())
    }

    async fn placement_update_time(&self) -> Result<u64> {
        Ok(self.state.lock().placement_stamp)
    }

    async fn save_progress(&self, query_id: QueryId, completed_chunks: u32) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(progress) = state.progress.get_mut(&query_id) {
            progress.completed_chunks = completed_chunks;
            progress.updated_ms = millis_since_epoch();
        }
        Ok(())
    }

    async fn progress(&self, query_id: QueryId) -> Result<Option<QueryProgress>> {
        Ok(self.state.lock().progress.get(&query_id).cloned())
    }

    async fn completed_between(
        &self,
        completed_before_ms: u64,
        completed_after_ms: u64,
    ) -> Result<Vec<QueryRecord>> {
        Ok(self
            .state
            .lock()
            .queries
            .values()
            .filter(|q| {
                q.completed_ms
                    .map(|t| t < completed_before_ms && t >= completed_after_ms)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn reap_query(&self, query_id: QueryId) -> Result<()> {
        let mut state = self.state.lock();
        state.queries.remove(&query_id);
        state.messages.retain(|m| m.query_id != query_id);
        state.tables.retain(|(qid, _, _)| *qid != query_id);
        state.progress.remove(&query_id);
        Ok(())
    }

    async fn metadata_select(&self, sql: &str) -> Result<SqlResults> {
        if !sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            return Err(CoreError::Config(
                "metadata_select accepts only SELECT statements".to_string(),
            ));
        }
        Ok(SqlResults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_query(coordinator_id: CoordinatorId) -> NewQuery {
        NewQuery {
            coordinator_id,
            user: "ada".into(),
            query: "SELECT 1".into(),
            chunk_template: "SELECT * FROM sky.objects_{chunk}".into(),
            merge_sql: String::new(),
            result_location: "result_#QID#".into(),
            message_table: "message_#QID#".into(),
            chunk_count: 2,
            tables: vec![("sky".into(), "objects".into())],
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_per_name() {
        let store = MemMetadataStore::new();
        let a = store.register_coordinator("cz").await.unwrap();
        let b = store.register_coordinator("cz").await.unwrap();
        assert_eq!(a, b);
        let c = store.register_coordinator("other").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn complete_on_unknown_query_is_a_consistency_error() {
        let store = MemMetadataStore::new();
        let err = store
            .complete_query(99, QueryStatus::Completed, 0, 0, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    #[tokio::test]
    async fn recovery_aborts_only_prior_executing() {
        let store = MemMetadataStore::new();
        let cz = store.register_coordinator("cz").await.unwrap();
        let q1 = store.add_query(new_query(cz)).await.unwrap();
        let q2 = store.add_query(new_query(cz)).await.unwrap();
        store
            .complete_query(q2, QueryStatus::Completed, 10, 100, Some(10))
            .await
            .unwrap();

        let aborted = store.abort_executing_queries(cz).await.unwrap();
        assert_eq!(aborted, 1);
        let rec = store.query_record(q1).await.unwrap();
        assert_eq!(rec.status, QueryStatus::Aborted);
        assert!(rec.completed_ms.is_some());
        let rec2 = store.query_record(q2).await.unwrap();
        assert_eq!(rec2.status, QueryStatus::Completed);
    }

    #[tokio::test]
    async fn result_table_expands_qid_token() {
        let store = MemMetadataStore::new();
        let cz = store.register_coordinator("cz").await.unwrap();
        let qid = store.add_query(new_query(cz)).await.unwrap();
        let rec = store.query_record(qid).await.unwrap();
        assert_eq!(rec.result_table(), format!("result_{}", qid));
    }

    #[tokio::test]
    async fn impact_index_reports_executing_queries_only() {
        let store = MemMetadataStore::new();
        let cz = store.register_coordinator("cz").await.unwrap();
        let q1 = store.add_query(new_query(cz)).await.unwrap();
        assert_eq!(store.queries_at_table("sky", "objects").await.unwrap(), vec![q1]);
        store
            .complete_query(q1, QueryStatus::Completed, 0, 0, None)
            .await
            .unwrap();
        assert!(store.queries_at_table("sky", "objects").await.unwrap().is_empty());
    }
}
