// Bundle lifecycle on the coordinator.
//
// One BundleSender exists per live bundle. It serializes the bundle to the
// wire form, POSTs it to the owning worker, and then waits for the worker's
// async callbacks. Exactly one terminal state is ever entered; jobs are
// handed back to the dispatcher when the bundle fails.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, warn};

use crate::common::{BundleId, ChunkId, JobId, QueryId, ScanInfo, WorkerId};
use crate::error::{CoreError, Result};
use crate::proto::bundle::{BundleMsg, DbTableMap, FragmentMsg, JobMsg, TemplateMap};
use crate::proto::status::{CoordinatorContact, WorkerContact};
use crate::proto::{AuthContext, ResponseMsg};

/// One fragment of a chunk query: the SQL statements to run plus the
/// sub-chunk ids and table references they mention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSpec {
    pub queries: Vec<String>,
    pub subchunk_ids: Vec<i32>,
    pub dbtables: Vec<(String, String)>,
}

/// A chunk-scoped unit of work, exclusively owned by at most one bundle.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    pub spec_db: String,
    pub attempt_count: u32,
    pub fragments: Vec<FragmentSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Created,
    InFlight,
    AwaitingResult,
    Fetching,
    Done,
    FailedTransport,
    FailedWorker,
    FailedMerge,
    Cancelled,
}

impl BundleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BundleState::Done
                | BundleState::FailedTransport
                | BundleState::FailedWorker
                | BundleState::FailedMerge
                | BundleState::Cancelled
        )
    }
}

/// What the coordinator should do with an incoming result-ready callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyDisposition {
    /// First notification: enqueue the file for merging.
    Merge,
    /// Duplicate delivery: acknowledge, no new merge work.
    AlreadyHandled,
    /// The bundle was cancelled; the worker should delete its file.
    Abandoned,
}

pub struct BundleSender {
    pub query_id: QueryId,
    pub bundle_id: BundleId,
    pub worker_id: WorkerId,
    row_limit: u64,
    max_result_mb: u64,
    scan: ScanInfo,
    interactive: bool,
    target: WorkerContact,
    czarinfo: CoordinatorContact,
    auth: AuthContext,
    client: Client,
    http_timeout: Duration,
    state: Mutex<BundleState>,
    jobs: Mutex<Vec<Job>>,
}

impl BundleSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_id: QueryId,
        bundle_id: BundleId,
        jobs: Vec<Job>,
        row_limit: u64,
        max_result_mb: u64,
        scan: ScanInfo,
        interactive: bool,
        target: WorkerContact,
        czarinfo: CoordinatorContact,
        auth: AuthContext,
        client: Client,
        http_timeout: Duration,
    ) -> Self {
        Self {
            query_id,
            bundle_id,
            worker_id: target.id.clone(),
            row_limit,
            max_result_mb,
            scan,
            interactive,
            target,
            czarinfo,
            auth,
            client,
            http_timeout,
            state: Mutex::new(BundleState::Created),
            jobs: Mutex::new(jobs),
        }
    }

    pub fn state(&self) -> BundleState {
        *self.state.lock()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.jobs.lock().iter().map(|j| j.chunk_id).collect()
    }

    /// Drain the jobs for reassignment. Only meaningful after a failure.
    pub fn take_jobs(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock())
    }

    fn transition(&self, from: &[BundleState], to: BundleState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&state) {
            debug!(
                query_id = self.query_id,
                bundle_id = self.bundle_id,
                ?state,
                ?to,
                "bundle transition"
            );
            *state = to;
            true
        } else {
            false
        }
    }

    /// Serialize this bundle to its wire form, interning templates and
    /// table references.
    pub fn build_msg(&self) -> BundleMsg {
        let mut templates = TemplateMap::new();
        let mut dbtables = DbTableMap::new();
        let jobs = self.jobs.lock();
        let mut job_msgs = Vec::with_capacity(jobs.len());
        for job in jobs.iter() {
            let mut fragments = Vec::with_capacity(job.fragments.len());
            for frag in &job.fragments {
                let template_indexes = frag
                    .queries
                    .iter()
                    .map(|q| templates.intern(q))
                    .collect();
                let dbtable_indexes = frag
                    .dbtables
                    .iter()
                    .map(|(db, table)| {
                        let idx = dbtables.intern(db, table);
                        if let Some(scan_table) = self
                            .scan
                            .tables
                            .iter()
                            .find(|t| t.db == *db && t.table == *table)
                        {
                            dbtables.set_scan_rating(
                                idx,
                                scan_table.scan_rating,
                                scan_table.lock_in_memory,
                            );
                        }
                        idx
                    })
                    .collect();
                fragments.push(FragmentMsg {
                    subquerytemplate_indexes: template_indexes,
                    dbtables_indexes: dbtable_indexes,
                    subchunkids: frag.subchunk_ids.clone(),
                });
            }
            job_msgs.push(JobMsg {
                job_id: job.job_id,
                attempt_count: job.attempt_count,
                query_spec_db: job.spec_db.clone(),
                chunk_id: job.chunk_id,
                query_fragments: fragments,
            });
        }
        BundleMsg {
            envelope: self.auth.envelope(),
            worker: self.worker_id.clone(),
            czarinfo: self.czarinfo.clone(),
            queryid: self.query_id,
            uberjobid: self.bundle_id,
            rowlimit: self.row_limit,
            maxtablesizemb: self.max_result_mb,
            scaninfo: self.scan.clone(),
            scaninteractive: self.interactive,
            subqueries_map: templates.to_wire(),
            dbtables_map: dbtables.to_wire(),
            jobs: job_msgs,
        }
    }

    /// Serialize and POST the bundle. On anything but `{"success":1}` the
    /// sender lands in FAILED_TRANSPORT and the caller reassigns the jobs.
    pub async fn start(&self) -> Result<()> {
        if !self.transition(&[BundleState::Created], BundleState::InFlight) {
            return Err(CoreError::Internal(format!(
                "bundle {}:{} started twice",
                self.query_id, self.bundle_id
            )));
        }
        let msg = self.build_msg();
        let url = format!("{}/queryjob", self.target.base_url());
        let outcome: Result<ResponseMsg> = async {
            let response = self
                .client
                .post(&url)
                .timeout(self.http_timeout)
                .json(&msg)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(CoreError::Transport(format!(
                    "queryjob returned HTTP {}",
                    response.status()
                )));
            }
            Ok(response.json::<ResponseMsg>().await?)
        }
        .await;

        match outcome {
            Ok(resp) if resp.is_success() => {
                self.transition(&[BundleState::InFlight], BundleState::AwaitingResult);
                Ok(())
            }
            Ok(resp) => {
                self.transition(&[BundleState::InFlight], BundleState::FailedTransport);
                Err(resp.to_error())
            }
            Err(e) => {
                self.transition(&[BundleState::InFlight], BundleState::FailedTransport);
                Err(e)
            }
        }
    }

    /// Worker reports the result file ready.
    pub fn on_result_ready(&self) -> ReadyDisposition {
        if self.transition(&[BundleState::AwaitingResult], BundleState::Fetching) {
            return ReadyDisposition::Merge;
        }
        match self.state() {
            BundleState::Cancelled => ReadyDisposition::Abandoned,
            other => {
                debug!(
                    query_id = self.query_id,
                    bundle_id = self.bundle_id,
                    state = ?other,
                    "duplicate or late result-ready"
                );
                ReadyDisposition::AlreadyHandled
            }
        }
    }

    /// Merge finished; returns false when the bundle was no longer fetching
    /// (e.g. cancelled mid-merge).
    pub fn on_merge_done(&self) -> bool {
        self.transition(&[BundleState::Fetching], BundleState::Done)
    }

    pub fn on_merge_failed(&self) -> bool {
        self.transition(&[BundleState::Fetching], BundleState::FailedMerge)
    }

    /// Worker-side execution failure arrived.
    pub fn on_worker_error(&self) -> bool {
        self.transition(
            &[BundleState::AwaitingResult, BundleState::InFlight],
            BundleState::FailedWorker,
        )
    }

    /// Transport-level failure detected outside the request path (peer
    /// death or restart).
    pub fn on_transport_lost(&self) -> bool {
        self.transition(
            &[
                BundleState::Created,
                BundleState::InFlight,
                BundleState::AwaitingResult,
                BundleState::Fetching,
            ],
            BundleState::FailedTransport,
        )
    }

    /// Returns true if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        let cancelled = self.transition(
            &[
                BundleState::Created,
                BundleState::InFlight,
                BundleState::AwaitingResult,
                BundleState::Fetching,
            ],
            BundleState::Cancelled,
        );
        if !cancelled && !self.state().is_terminal() {
            warn!(
                query_id = self.query_id,
                bundle_id = self.bundle_id,
                "cancel left bundle in non-terminal state"
            );
        }
        cancelled
    }
}
