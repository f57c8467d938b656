// Bundle acceptance.
//
// Validates the wire envelope, rejects duplicates idempotently, rebuilds
// the bundle from its interned template and table maps, and registers one
// task per expanded fragment statement set. All further communication with
// the coordinator is asynchronous.
//
// Template expansion: a fragment template may reference `{db}`, `{table}`,
// `{chunk}`, and `{subchunk}`. `{db}`/`{table}` resolve against the
// fragment's first table reference, `{chunk}` against the job's chunk id,
// and `{subchunk}` produces one statement per sub-chunk id (templates
// without `{subchunk}` expand once).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::files::result_file_name;
use super::WorkerService;
use crate::common::{BundleId, CancelFlag, ChunkId, CoordinatorId, QueryId};
use crate::error::{CoreError, Result};
use crate::proto::bundle::{BundleMsg, DbTableMap, TemplateMap};
use crate::proto::status::CoordinatorContact;
use crate::worker::files::RowFileWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
}

/// Terminal outcome of a whole bundle, produced when its last task ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleOutcome {
    /// All tasks complete; publish the file and notify the coordinator.
    Publish { rowcap_hit: bool },
    /// At least one task failed; the first error stands for the bundle.
    Failed { errno: i32, message: String },
    Cancelled { delete_file: bool },
}

struct BundleProgress {
    remaining: usize,
    rows_written: u64,
    rowcap_hit: bool,
    first_error: Option<(i32, String)>,
    cancelled: bool,
    delete_file_on_cancel: bool,
    /// The ready notification reached the coordinator.
    acked: bool,
    published: bool,
}

pub struct WorkerBundle {
    pub czar: CoordinatorContact,
    pub query_id: QueryId,
    pub bundle_id: BundleId,
    pub row_limit: u64,
    pub file_name: String,
    pub cancel: CancelFlag,
    progress: Mutex<BundleProgress>,
    pub writer: tokio::sync::Mutex<Option<RowFileWriter>>,
}

impl WorkerBundle {
    fn new(
        czar: CoordinatorContact,
        query_id: QueryId,
        bundle_id: BundleId,
        row_limit: u64,
        task_count: usize,
        writer: RowFileWriter,
    ) -> Self {
        let file_name = result_file_name(czar.id, query_id, bundle_id);
        Self {
            czar,
            query_id,
            bundle_id,
            row_limit,
            file_name,
            cancel: CancelFlag::new(),
            progress: Mutex::new(BundleProgress {
                remaining: task_count,
                rows_written: 0,
                rowcap_hit: false,
                first_error: None,
                cancelled: false,
                delete_file_on_cancel: false,
                acked: false,
                published: false,
            }),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    /// Count rows appended by a task; returns false once the bundle's row
    /// cap is reached, at which point the caller stops reading.
    pub fn note_rows(&self, added: u64) -> bool {
        let mut progress = self.progress.lock();
        progress.rows_written += added;
        if self.row_limit > 0 && progress.rows_written >= self.row_limit {
            progress.rowcap_hit = true;
            return false;
        }
        true
    }

    pub fn rows_written(&self) -> u64 {
        self.progress.lock().rows_written
    }

    pub fn note_error(&self, errno: i32, message: String) {
        let mut progress = self.progress.lock();
        if progress.first_error.is_none() {
            progress.first_error = Some((errno, message));
        }
    }

    /// Advisory cancel; tasks notice at their next suspension point.
    pub fn request_cancel(&self, delete_file: bool) {
        let mut progress = self.progress.lock();
        progress.cancelled = true;
        progress.delete_file_on_cancel |= delete_file;
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.progress.lock().cancelled
    }

    pub fn mark_published(&self) {
        self.progress.lock().published = true;
    }

    pub fn is_published(&self) -> bool {
        self.progress.lock().published
    }

    pub fn mark_acked(&self) {
        self.progress.lock().acked = true;
    }

    pub fn is_acked(&self) -> bool {
        self.progress.lock().acked
    }

    /// Record one task's end; yields the bundle outcome when it was the
    /// last task.
    pub fn task_finished(&self) -> Option<BundleOutcome> {
        let mut progress = self.progress.lock();
        progress.remaining = progress.remaining.saturating_sub(1);
        if progress.remaining > 0 {
            return None;
        }
        if progress.cancelled {
            return Some(BundleOutcome::Cancelled {
                delete_file: progress.delete_file_on_cancel,
            });
        }
        if let Some((errno, message)) = progress.first_error.clone() {
            return Some(BundleOutcome::Failed { errno, message });
        }
        Some(BundleOutcome::Publish {
            rowcap_hit: progress.rowcap_hit,
        })
    }
}

pub struct WorkerTask {
    pub task_id: u64,
    pub chunk_id: ChunkId,
    pub bundle: Arc<WorkerBundle>,
    pub statements: Vec<String>,
    pub priority: i32,
    pub interactive: bool,
    state: Mutex<TaskState>,
}

impl WorkerTask {
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }
}

pub type BundleKey = (CoordinatorId, QueryId, BundleId);

impl WorkerService {
    /// Validate and register one bundle. A duplicate `(query, bundle)` is
    /// an idempotent success; every rejection carries a typed error.
    pub async fn accept_bundle(&self, msg: BundleMsg) -> Result<()> {
        self.auth().verify(&msg.envelope)?;
        if msg.worker != self.identity.id {
            return Err(CoreError::WorkerRejectedBundle {
                retryable: false,
                reason: format!(
                    "bundle targets worker '{}', this is '{}'",
                    msg.worker, self.identity.id
                ),
            });
        }
        msg.validate_indices()?;

        let key: BundleKey = (msg.czarinfo.id, msg.queryid, msg.uberjobid);
        if self.bundles.contains_key(&key) {
            debug!(
                query_id = msg.queryid,
                bundle_id = msg.uberjobid,
                "duplicate bundle accepted idempotently"
            );
            return Ok(());
        }

        if let Some(peer) = self.czars.get(msg.czarinfo.id) {
            if !peer.is_alive() {
                return Err(CoreError::WorkerRejectedBundle {
                    retryable: true,
                    reason: format!("coordinator {} is marked dead here", msg.czarinfo.id),
                });
            }
        }
        self.czars.upsert(msg.czarinfo.clone());

        let templates = TemplateMap::from_wire(&msg.subqueries_map);
        let dbtables = DbTableMap::from_wire(&msg.dbtables_map);

        // Expand fragments before anything is registered so a malformed
        // bundle is rejected whole.
        let mut expanded: Vec<(ChunkId, Vec<String>)> = Vec::with_capacity(msg.jobs.len());
        for job in &msg.jobs {
            let mut statements = Vec::new();
            for frag in &job.query_fragments {
                let (db, table) = match frag.dbtables_indexes.first() {
                    Some(idx) => {
                        let (db, table) = dbtables.get(*idx)?;
                        (db.to_string(), table.to_string())
                    }
                    None => (job.query_spec_db.clone(), String::new()),
                };
                for template_idx in &frag.subquerytemplate_indexes {
                    let template = templates.get(*template_idx)?;
                    let base = template
                        .replace("{db}", &db)
                        .replace("{table}", &table)
                        .replace("{chunk}", &job.chunk_id.to_string());
                    if base.contains("{subchunk}") && !frag.subchunkids.is_empty() {
                        for subchunk in &frag.subchunkids {
                            statements.push(base.replace("{subchunk}", &subchunk.to_string()));
                        }
                    } else {
                        statements.push(base);
                    }
                }
            }
            expanded.push((job.chunk_id, statements));
        }

        let file_name = result_file_name(msg.czarinfo.id, msg.queryid, msg.uberjobid);
        let writer = self.files.create_writer(&file_name).await?;
        let bundle = Arc::new(WorkerBundle::new(
            msg.czarinfo.clone(),
            msg.queryid,
            msg.uberjobid,
            msg.rowlimit,
            expanded.len(),
            writer,
        ));
        self.bundles.insert(key, bundle.clone());

        for (i, (chunk_id, statements)) in expanded.into_iter().enumerate() {
            let task = Arc::new(WorkerTask {
                task_id: self.next_task_id(),
                chunk_id,
                bundle: bundle.clone(),
                statements,
                priority: msg.scaninfo.priority,
                interactive: msg.scaninteractive,
                state: Mutex::new(TaskState::Queued),
            });
            debug!(
                task_id = task.task_id,
                chunk_id,
                ordinal = i,
                "task registered"
            );
            self.scheduler.enqueue(task);
        }
        info!(
            query_id = msg.queryid,
            bundle_id = msg.uberjobid,
            jobs = msg.jobs.len(),
            "bundle accepted"
        );
        Ok(())
    }

    pub fn bundle(&self, key: &BundleKey) -> Option<Arc<WorkerBundle>> {
        self.bundles.get(key).map(|b| b.clone())
    }

    pub fn bundles_for_query(
        &self,
        czar_id: CoordinatorId,
        query_id: QueryId,
    ) -> Vec<Arc<WorkerBundle>> {
        self.bundles
            .iter()
            .filter(|e| e.key().0 == czar_id && e.key().1 == query_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn bundles_for_czar(&self, czar_id: CoordinatorId) -> Vec<Arc<WorkerBundle>> {
        self.bundles
            .iter()
            .filter(|e| e.key().0 == czar_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn drop_bundle(&self, key: &BundleKey) {
        self.bundles.remove(key);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::proto::status::CoordinatorContact;

    /// Build a detached task for scheduler tests.
    pub fn test_task(task_id: u64, interactive: bool, priority: i32) -> Arc<WorkerTask> {
        let bundle = Arc::new(WorkerBundle::new(
            CoordinatorContact {
                name: "cz".into(),
                id: 1,
                management_host: "h".into(),
                management_port: 7080,
                startup_epoch: 1,
            },
            1,
            task_id,
            0,
            1,
            // Tests that never run the task don't need a real file.
            dummy_writer(),
        ));
        Arc::new(WorkerTask {
            task_id,
            chunk_id: 0,
            bundle,
            statements: vec![],
            priority,
            interactive,
            state: Mutex::new(TaskState::Queued),
        })
    }

    fn dummy_writer() -> RowFileWriter {
        // A writer over a temp file that is dropped with the dir.
        let dir = std::env::temp_dir().join("scatterdb-test-writers");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("w-{}.part", uuid::Uuid::new_v4()));
        let file = std::fs::File::create(&path).unwrap();
        RowFileWriter::from_std_for_tests(file)
    }

    #[test]
    fn bundle_outcome_prefers_cancel_over_error() {
        let bundle = test_task(1, false, 0).bundle.clone();
        bundle.note_error(1064, "syntax".into());
        bundle.request_cancel(true);
        match bundle.task_finished() {
            Some(BundleOutcome::Cancelled { delete_file }) => assert!(delete_file),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn row_cap_trips_once_reached() {
        let bundle = Arc::new(WorkerBundle::new(
            CoordinatorContact {
                name: "cz".into(),
                id: 1,
                management_host: "h".into(),
                management_port: 7080,
                startup_epoch: 1,
            },
            1,
            1,
            10,
            1,
            dummy_writer(),
        ));
        assert!(bundle.note_rows(6));
        assert!(!bundle.note_rows(6));
        match bundle.task_finished() {
            Some(BundleOutcome::Publish { rowcap_hit }) => assert!(rowcap_hit),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
