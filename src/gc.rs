// # Garbage Collection
//
// Two periodic sweeps on the coordinator:
//
//  1. Async-result sweep: completed queries whose completion time is past
//     the async-retention threshold (but not yet past hard retention) have
//     their result and message tables dropped and their journal entries
//     reaped.
//  2. Hard-retention sweep: any table in the dedicated result schema older
//     than the hard threshold is dropped regardless of association, so that
//     schema must hold nothing else.
//
// The worker's analogous file sweep lives with the file store. Both loops
// tolerate misconfiguration through the config floors and survive
// transient storage errors by logging and continuing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::common::millis_since_epoch;
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::metadata::{MessageStore, QueryMetadata};
use crate::sql::SqlConnection;

pub struct CoordinatorGc {
    metadata: Arc<dyn QueryMetadata>,
    result_db: Arc<dyn SqlConnection>,
    messages: Arc<MessageStore>,
    retention: RetentionConfig,
    result_schema: String,
}

impl CoordinatorGc {
    pub fn new(
        metadata: Arc<dyn QueryMetadata>,
        result_db: Arc<dyn SqlConnection>,
        messages: Arc<MessageStore>,
        retention: RetentionConfig,
        result_schema: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            result_db,
            messages,
            retention: retention.clamped(),
            result_schema,
        })
    }

    /// Spawn both sweep loops.
    pub fn spawn(self: &Arc<Self>) {
        let gc = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs((gc.retention.async_retention_secs / 2).max(30));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match gc.async_results_sweep().await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "async result sweep reclaimed queries"),
                    Err(e) => warn!(error = %e, "async result sweep failed"),
                }
            }
        });

        let gc = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(gc.retention.async_retention_secs.max(60));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match gc.hard_retention_sweep().await {
                    Ok(0) => {}
                    Ok(dropped) => info!(dropped, "hard retention sweep dropped tables"),
                    Err(e) => warn!(error = %e, "hard retention sweep failed"),
                }
            }
        });
    }

    /// Sweep 1: drop result/message tables of completed queries past async
    /// retention, then reap their journal rows. Returns queries reclaimed.
    pub async fn async_results_sweep(&self) -> Result<usize> {
        let now = millis_since_epoch();
        let async_cutoff = now.saturating_sub(self.retention.async_retention_secs * 1000);
        let hard_cutoff = now.saturating_sub(self.retention.hard_retention_secs * 1000);
        let expired = self
            .metadata
            .completed_between(async_cutoff, hard_cutoff)
            .await?;
        let mut reaped = 0;
        for record in expired {
            let result_table = record.result_table();
            let message_table = record
                .message_table
                .replace("#QID#", &record.query_id.to_string());
            for table in [result_table, message_table] {
                if table.is_empty() {
                    continue;
                }
                let sql = format!(
                    "DROP TABLE IF EXISTS `{}`.`{}`",
                    self.result_schema, table
                );
                if let Err(e) = self.result_db.execute(&sql).await {
                    warn!(query_id = record.query_id, table, error = %e, "table drop failed");
                }
            }
            if let Err(e) = self.metadata.reap_query(record.query_id).await {
                warn!(query_id = record.query_id, error = %e, "journal reap failed");
                continue;
            }
            self.messages.remove_query(record.query_id);
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Sweep 2: drop any table in the result schema older than the hard
    /// threshold, associated or not. Returns tables dropped.
    pub async fn hard_retention_sweep(&self) -> Result<usize> {
        let cutoff_secs = millis_since_epoch() / 1000 - self.retention.hard_retention_secs;
        let list_sql = format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{}' \
             AND UNIX_TIMESTAMP(COALESCE(update_time, create_time)) < {}",
            crate::sql::escape_string(&self.result_schema),
            cutoff_secs
        );
        let results = self.result_db.query(&list_sql).await?;
        let mut dropped = 0;
        for row in &results.rows {
            let Some(table) = row.0.first().cloned().flatten() else {
                continue;
            };
            let sql = format!("DROP TABLE IF EXISTS `{}`.`{}`", self.result_schema, table);
            match self.result_db.execute(&sql).await {
                Ok(_) => dropped += 1,
                Err(e) => warn!(table, error = %e, "hard retention drop failed"),
            }
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MemMetadataStore, NewQuery, QueryStatus};
    use crate::sql::{MockSqlConnection, SqlResults, SqlRow};

    fn retention() -> RetentionConfig {
        RetentionConfig {
            async_retention_secs: 60,
            hard_retention_secs: 86_400,
            worker_file_retention_secs: 60,
        }
    }

    async fn completed_query(store: &MemMetadataStore) -> u64 {
        let cz = store.register_coordinator("cz").await.unwrap();
        let qid = store
            .add_query(NewQuery {
                coordinator_id: cz,
                user: "u".into(),
                query: "SELECT 1".into(),
                chunk_template: String::new(),
                merge_sql: String::new(),
                result_location: "result_#QID#".into(),
                message_table: "message_#QID#".into(),
                chunk_count: 1,
                tables: vec![],
            })
            .await
            .unwrap();
        store
            .complete_query(qid, QueryStatus::Completed, 5, 50, Some(5))
            .await
            .unwrap();
        qid
    }

    #[tokio::test]
    async fn fresh_queries_survive_the_async_sweep() {
        let store = Arc::new(MemMetadataStore::new());
        let qid = completed_query(&store).await;
        let result_db = MockSqlConnection::new();
        let gc = CoordinatorGc::new(
            store.clone(),
            Arc::new(result_db),
            Arc::new(MessageStore::new(None)),
            retention(),
            "scatter_results".into(),
        );
        // Completed a moment ago: inside async retention, nothing reaped.
        assert_eq!(gc.async_results_sweep().await.unwrap(), 0);
        assert!(store.query_record(qid).await.is_ok());
    }

    #[tokio::test]
    async fn hard_sweep_drops_any_old_table() {
        let store = Arc::new(MemMetadataStore::new());
        let result_db = MockSqlConnection::new();
        result_db.push_result(SqlResults {
            columns: vec!["table_name".into()],
            rows: vec![
                SqlRow(vec![Some("result_12".into())]),
                SqlRow(vec![Some("unrelated_scratch".into())]),
            ],
        });
        let gc = CoordinatorGc::new(
            store,
            Arc::new(result_db.clone()),
            Arc::new(MessageStore::new(None)),
            retention(),
            "scatter_results".into(),
        );
        assert_eq!(gc.hard_retention_sweep().await.unwrap(), 2);
        assert!(result_db.saw("DROP TABLE IF EXISTS `scatter_results`.`result_12`"));
        assert!(result_db.saw("DROP TABLE IF EXISTS `scatter_results`.`unrelated_scratch`"));
    }

    #[tokio::test]
    async fn sweep_continues_past_drop_errors() {
        let store = Arc::new(MemMetadataStore::new());
        let result_db = MockSqlConnection::new();
        result_db.push_result(SqlResults {
            columns: vec!["table_name".into()],
            rows: vec![
                SqlRow(vec![Some("t1".into())]),
                SqlRow(vec![Some("t2".into())]),
            ],
        });
        result_db.fail_matching("`t1`", crate::error::CoreError::Transport("flaky".into()));
        let gc = CoordinatorGc::new(
            store,
            Arc::new(result_db.clone()),
            Arc::new(MessageStore::new(None)),
            retention(),
            "scatter_results".into(),
        );
        // First drop fails, the second still runs.
        assert_eq!(gc.hard_retention_sweep().await.unwrap(), 1);
    }
}
