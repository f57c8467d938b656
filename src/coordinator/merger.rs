// Result merging.
//
// A bounded pool pulls ready result files from workers and streams their
// rows into the query's merge table. At most `per_worker_pulls` concurrent
// pulls hit any single worker so one node is never saturated; pulls from
// different workers interleave freely. HTTP failures retry with capped
// exponential backoff; past the retry limit the bundle is failed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use reqwest::Client;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, warn};

use super::dispatcher::QueryDispatcher;
use crate::common::{BundleId, QueryId, WorkerId};
use crate::config::MergeConfig;
use crate::error::{CoreError, Result};
use crate::rows;
use crate::sql::SqlConnection;

pub struct MergeTask {
    pub dispatcher: Weak<QueryDispatcher>,
    pub query_id: QueryId,
    pub bundle_id: BundleId,
    pub worker_id: WorkerId,
    pub file_url: String,
    pub merge_table: String,
    pub expected_rows: u64,
    pub expected_bytes: u64,
}

pub struct ResultMerger {
    config: MergeConfig,
    client: Client,
    result_db: Arc<dyn SqlConnection>,
    tx: mpsc::Sender<MergeTask>,
    per_worker: DashMap<WorkerId, Arc<Semaphore>>,
}

impl ResultMerger {
    /// Spawn the merge pool and return its handle.
    pub fn start(config: MergeConfig, result_db: Arc<dyn SqlConnection>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<MergeTask>(4096);
        let merger = Arc::new(Self {
            config: config.clamped(),
            client: crate::common::http_client(),
            result_db,
            tx,
            per_worker: DashMap::new(),
        });
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..merger.config.pool_size {
            let merger = merger.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => merger.process(task).await,
                        None => return,
                    }
                }
            });
        }
        merger
    }

    pub async fn enqueue(&self, task: MergeTask) {
        if self.tx.send(task).await.is_err() {
            warn!("merge pool is shut down; dropping merge task");
        }
    }

    fn worker_permit(&self, worker_id: &WorkerId) -> Arc<Semaphore> {
        self.per_worker
            .entry(worker_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_worker_pulls)))
            .clone()
    }

    async fn process(&self, task: MergeTask) {
        let semaphore = self.worker_permit(&task.worker_id);
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let outcome = self.pull_and_merge(&task).await;
        let Some(dispatcher) = task.dispatcher.upgrade() else {
            return;
        };
        match outcome {
            Ok((merged_rows, bytes)) => {
                dispatcher
                    .on_merge_done(task.bundle_id, merged_rows, bytes)
                    .await
            }
            Err(e) => dispatcher.on_merge_failed(task.bundle_id, e).await,
        }
    }

    /// Fetch the file (with retries) and ingest its rows; returns the rows
    /// and bytes actually merged, which may stop short of the file under a
    /// row cap.
    async fn pull_and_merge(&self, task: &MergeTask) -> Result<(u64, u64)> {
        let mut attempt = 0u32;
        let body = loop {
            match self.fetch(&task.file_url).await {
                Ok(body) => break body,
                Err(e) if attempt < self.config.retry_limit => {
                    attempt += 1;
                    let backoff = self.backoff(attempt);
                    debug!(
                        url = %task.file_url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "result pull failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        let bytes_total = body.len() as u64;
        let mut merged_rows: u64 = 0;
        let mut batch: Vec<String> = Vec::with_capacity(self.config.insert_batch_rows);
        for line in body.lines() {
            if line.is_empty() {
                continue;
            }
            let fields = rows::decode_row(line)
                .map_err(|e| CoreError::MergeWrite(format!("bad result row: {}", e)))?;
            let values: Vec<String> = fields.iter().map(rows::sql_literal).collect();
            batch.push(format!("({})", values.join(", ")));
            if batch.len() >= self.config.insert_batch_rows {
                let (inserted, exhausted) = self.flush(task, &mut batch).await?;
                merged_rows += inserted;
                if exhausted {
                    return Ok((merged_rows, bytes_total));
                }
            }
        }
        if !batch.is_empty() {
            let (inserted, _) = self.flush(task, &mut batch).await?;
            merged_rows += inserted;
        }
        if merged_rows != task.expected_rows {
            // Normal under a row cap; otherwise the worker announced a
            // different count than the file held.
            debug!(
                query_id = task.query_id,
                bundle_id = task.bundle_id,
                merged_rows,
                announced = task.expected_rows,
                "merged row count differs from announced count"
            );
        }
        Ok((merged_rows, bytes_total))
    }

    /// Insert one batch, truncated to quota claimed under the query's row
    /// cap. Returns (rows inserted, cap exhausted).
    async fn flush(&self, task: &MergeTask, batch: &mut Vec<String>) -> Result<(u64, bool)> {
        let want = batch.len() as u64;
        let granted = match task.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.claim_rows(want),
            // Dispatcher already gone; the result is unreachable anyway.
            None => 0,
        };
        if granted == 0 {
            batch.clear();
            return Ok((0, true));
        }
        let take = granted as usize;
        let sql = format!(
            "INSERT INTO {} VALUES {}",
            task.merge_table,
            batch[..take].join(", ")
        );
        if let Err(e) = self.result_db.execute(&sql).await {
            if let Some(dispatcher) = task.dispatcher.upgrade() {
                dispatcher.release_rows(granted);
            }
            return Err(CoreError::MergeWrite(e.to_string()));
        }
        let exhausted = granted < want;
        batch.clear();
        Ok((granted, exhausted))
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.pull_timeout_secs))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CoreError::Transport(format!(
                "result pull returned HTTP {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.backoff_max_ms);
        let jitter = rand::rng().random_range(0..=base / 4 + 1);
        Duration::from_millis(base + jitter)
    }

    /// Final merge phase after all bundles succeed. `#QID#` and `#RESULT#`
    /// tokens in the recorded merge SQL expand to the query id and the
    /// merge-table name. Returns the statement's affected-row count.
    pub async fn run_final_merge(
        &self,
        merge_sql: &str,
        query_id: QueryId,
        result_table: &str,
    ) -> Result<Option<u64>> {
        if merge_sql.trim().is_empty() {
            return Ok(None);
        }
        let sql = merge_sql
            .replace("#QID#", &query_id.to_string())
            .replace("#RESULT#", result_table);
        let affected = self
            .result_db
            .execute(&sql)
            .await
            .map_err(|e| CoreError::MergeWrite(e.to_string()))?;
        Ok(Some(affected))
    }
}
