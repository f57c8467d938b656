// Query dispatch.
//
// `Coordinator` is the per-process container: identity, shared services,
// and the live `QueryDispatcher` per query. A dispatcher owns its query
// exclusively: it builds the job list, groups jobs into per-worker bundles,
// reacts to bundle outcomes, enforces the row cap, and is the only layer
// that writes a terminal status into the metadata store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{error, info, warn};

use super::bundle::{BundleSender, FragmentSpec, Job, ReadyDisposition};
use super::merger::{MergeTask, ResultMerger};
use super::registry::ChunkPlacement;
use crate::common::{
    millis_since_epoch, BundleId, ChunkId, QueryId, ScanInfo, WorkerId,
};
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, Recovery, Result};
use crate::identity::CoordinatorIdentity;
use crate::metadata::{
    MessageStore, NewQuery, QueryMessage, QueryMetadata, QueryStatus, Severity,
};
use crate::peering::{PeerEvents, PeerTracker};
use crate::proto::notify::{BundleErrorMsg, BundleReadyMsg};
use crate::proto::status::{AcceptedReady, ComIssueMsg, ComIssueResponse};
use crate::proto::{AuthContext, ResponseMsg};

/// One chunk's worth of rewritten SQL, produced by the (external) parser.
#[derive(Debug, Clone)]
pub struct ChunkQuerySpec {
    pub chunk_id: ChunkId,
    pub spec_db: String,
    pub fragments: Vec<FragmentSpec>,
}

/// A parsed, rewritten user query as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub user: String,
    pub sql: String,
    pub chunk_queries: Vec<ChunkQuerySpec>,
    pub chunk_template: String,
    pub merge_sql: String,
    /// May contain `#QID#`, expanded once the query id is known.
    pub result_location: String,
    pub message_table: String,
    /// 0 = unlimited.
    pub row_limit: u64,
    /// True when the rewrite permits truncated results under the row cap.
    pub truncatable: bool,
    pub scan: ScanInfo,
    pub interactive: bool,
    pub max_result_mb: u64,
    pub tables: Vec<(String, String)>,
}

struct DispatchState {
    bundles: HashMap<BundleId, Arc<BundleSender>>,
    next_bundle_id: BundleId,
    collected_rows: u64,
    collected_bytes: u64,
    /// Rows claimed by in-flight merges, counted against the cap before
    /// the merge completes so parallel pulls cannot overshoot it.
    reserved_rows: u64,
    completed_chunks: u32,
    rowcap_hit: bool,
    terminal: Option<QueryStatus>,
    finishing: bool,
}

pub struct QueryDispatcher {
    pub query_id: QueryId,
    spec: QuerySpec,
    config: Arc<CoordinatorConfig>,
    identity: CoordinatorIdentity,
    auth: AuthContext,
    metadata: Arc<dyn QueryMetadata>,
    messages: Arc<MessageStore>,
    placement: Arc<ChunkPlacement>,
    peers: Arc<PeerTracker>,
    merger: Arc<ResultMerger>,
    client: Client,
    state: Mutex<DispatchState>,
    self_weak: Weak<QueryDispatcher>,
}

impl QueryDispatcher {
    #[allow(clippy::too_many_arguments)]
    fn new_cyclic(
        query_id: QueryId,
        spec: QuerySpec,
        config: Arc<CoordinatorConfig>,
        identity: CoordinatorIdentity,
        auth: AuthContext,
        metadata: Arc<dyn QueryMetadata>,
        messages: Arc<MessageStore>,
        placement: Arc<ChunkPlacement>,
        peers: Arc<PeerTracker>,
        merger: Arc<ResultMerger>,
        client: Client,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            query_id,
            spec,
            config,
            identity,
            auth,
            metadata,
            messages,
            placement,
            peers,
            merger,
            client,
            state: Mutex::new(DispatchState {
                bundles: HashMap::new(),
                next_bundle_id: 0,
                collected_rows: 0,
                collected_bytes: 0,
                reserved_rows: 0,
                completed_chunks: 0,
                rowcap_hit: false,
                terminal: None,
                finishing: false,
            }),
            self_weak: weak.clone(),
        })
    }

    pub fn status(&self) -> Option<QueryStatus> {
        self.state.lock().terminal
    }

    pub fn collected_rows(&self) -> u64 {
        self.state.lock().collected_rows
    }

    /// Rows the merger may still ingest under the cap; `None` = unlimited.
    pub fn remaining_cap(&self) -> Option<u64> {
        if self.spec.row_limit == 0 {
            return None;
        }
        let state = self.state.lock();
        Some(
            self.spec
                .row_limit
                .saturating_sub(state.collected_rows + state.reserved_rows),
        )
    }

    /// Atomically claim merge quota under the row cap. Returns the rows
    /// granted (all of `want` when the query is uncapped).
    pub fn claim_rows(&self, want: u64) -> u64 {
        if self.spec.row_limit == 0 {
            return want;
        }
        let mut state = self.state.lock();
        let used = state.collected_rows + state.reserved_rows;
        let granted = want.min(self.spec.row_limit.saturating_sub(used));
        state.reserved_rows += granted;
        granted
    }

    /// Return quota claimed for rows that were never merged.
    pub fn release_rows(&self, unused: u64) {
        let mut state = self.state.lock();
        state.reserved_rows = state.reserved_rows.saturating_sub(unused);
    }

    /// The concrete merge-table name for this query.
    pub fn result_table(&self) -> String {
        self.spec
            .result_location
            .replace("#QID#", &self.query_id.to_string())
    }

    fn bundle(&self, bundle_id: BundleId) -> Option<Arc<BundleSender>> {
        self.state.lock().bundles.get(&bundle_id).cloned()
    }

    fn involved_workers(&self) -> Vec<WorkerId> {
        let state = self.state.lock();
        let mut workers: Vec<WorkerId> =
            state.bundles.values().map(|b| b.worker_id.clone()).collect();
        workers.sort();
        workers.dedup();
        workers
    }

    async fn record_message(&self, source: &str, severity: Severity, code: i32, text: String) {
        let msg = QueryMessage {
            query_id: self.query_id,
            chunk_id: -1,
            code,
            severity,
            text,
            timestamp_ms: millis_since_epoch(),
        };
        if let Err(e) = self.messages.add(source, msg).await {
            warn!(query_id = self.query_id, error = %e, "failed to journal message");
        }
    }

    /// Build the initial job list and dispatch one bundle set. Returns as
    /// soon as the bundle starts are spawned.
    async fn start(self: &Arc<Self>) -> Result<()> {
        let mut jobs = Vec::with_capacity(self.spec.chunk_queries.len());
        for (i, chunk_query) in self.spec.chunk_queries.iter().enumerate() {
            jobs.push(Job {
                job_id: (i + 1) as u64,
                chunk_id: chunk_query.chunk_id,
                spec_db: chunk_query.spec_db.clone(),
                attempt_count: 1,
                fragments: chunk_query.fragments.clone(),
            });
        }
        self.dispatch_jobs(jobs).await
    }

    /// Group `jobs` by their current owner worker and launch one bundle per
    /// group (split at the configured bundle size).
    fn dispatch_jobs<'a>(
        self: &'a Arc<Self>,
        jobs: Vec<Job>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
        self.placement.refresh_if_stale().await?;
        let mut by_worker: HashMap<WorkerId, Vec<Job>> = HashMap::new();
        for job in jobs {
            let worker = self
                .placement
                .worker_for(job.chunk_id)
                .await?
                .ok_or_else(|| {
                    CoreError::Internal(format!("no worker owns chunk {}", job.chunk_id))
                })?;
            by_worker.entry(worker).or_default().push(job);
        }

        let mut launches = Vec::new();
        for (worker_id, worker_jobs) in by_worker {
            let peer = self.peers.get(&worker_id).ok_or_else(|| {
                CoreError::Transport(format!("worker {} is not registered", worker_id))
            })?;
            if !peer.is_alive() {
                return Err(CoreError::Transport(format!(
                    "worker {} is marked dead",
                    worker_id
                )));
            }
            let target = peer.contact();
            let mut remaining = worker_jobs;
            while !remaining.is_empty() {
                let take = remaining.len().min(self.config.bundle_max_jobs);
                let batch: Vec<Job> = remaining.drain(..take).collect();
                let sender = {
                    let mut state = self.state.lock();
                    state.next_bundle_id += 1;
                    let sender = Arc::new(BundleSender::new(
                        self.query_id,
                        state.next_bundle_id,
                        batch,
                        self.spec.row_limit,
                        self.spec.max_result_mb,
                        self.spec.scan.clone(),
                        self.spec.interactive,
                        target.clone(),
                        self.identity.contact(),
                        self.auth.clone(),
                        self.client.clone(),
                        Duration::from_secs(self.config.peer.http_timeout_secs),
                    ));
                    state.bundles.insert(sender.bundle_id, sender.clone());
                    sender
                };
                launches.push(sender);
            }
        }

        for sender in launches {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = sender.start().await {
                    dispatcher.on_bundle_failed(sender.bundle_id, e).await;
                }
            });
        }
        Ok(())
        })
    }

    /// Worker callback: a bundle's result file is ready.
    pub async fn on_result_ready(
        self: &Arc<Self>,
        bundle_id: BundleId,
        file_url: String,
        row_count: u64,
        file_size: u64,
    ) -> ResponseMsg {
        let Some(sender) = self.bundle(bundle_id) else {
            // Unknown bundle (e.g. query already reaped): the worker may
            // delete its file.
            return ResponseMsg::ok_note("abandoned");
        };
        match sender.on_result_ready() {
            ReadyDisposition::Merge => {
                self.merger
                    .enqueue(MergeTask {
                        dispatcher: self.self_weak.clone(),
                        query_id: self.query_id,
                        bundle_id,
                        worker_id: sender.worker_id.clone(),
                        file_url,
                        merge_table: self.result_table(),
                        expected_rows: row_count,
                        expected_bytes: file_size,
                    })
                    .await;
                ResponseMsg::ok()
            }
            ReadyDisposition::AlreadyHandled => ResponseMsg::ok_note("queued for collection"),
            ReadyDisposition::Abandoned => ResponseMsg::ok_note("abandoned"),
        }
    }

    /// Merger callback: the file was ingested into the merge table.
    pub async fn on_merge_done(self: &Arc<Self>, bundle_id: BundleId, rows: u64, bytes: u64) {
        let Some(sender) = self.bundle(bundle_id) else {
            return;
        };
        if !sender.on_merge_done() {
            // Cancelled mid-merge; the rows are discarded with the table.
            return;
        }
        let (completed_chunks, cap_newly_hit) = {
            let mut state = self.state.lock();
            state.collected_rows += rows;
            state.reserved_rows = state.reserved_rows.saturating_sub(rows);
            state.collected_bytes += bytes;
            state.completed_chunks += sender.job_count() as u32;
            let cap_newly_hit = self.spec.row_limit > 0
                && !state.rowcap_hit
                && state.collected_rows >= self.spec.row_limit;
            if cap_newly_hit {
                state.rowcap_hit = true;
            }
            (state.completed_chunks, cap_newly_hit)
        };

        if let Err(e) = self
            .metadata
            .save_progress(self.query_id, completed_chunks)
            .await
        {
            warn!(query_id = self.query_id, error = %e, "progress update failed");
        }

        if cap_newly_hit {
            self.handle_rowcap().await;
        }
        self.maybe_finish().await;
    }

    /// Merger callback: ingestion failed.
    pub async fn on_merge_failed(self: &Arc<Self>, bundle_id: BundleId, err: CoreError) {
        let Some(sender) = self.bundle(bundle_id) else {
            return;
        };
        if sender.on_merge_failed() {
            self.on_bundle_failed(bundle_id, err).await;
        }
    }

    /// Worker callback: bundle execution failed on the worker.
    pub async fn on_worker_error(self: &Arc<Self>, msg: &BundleErrorMsg) -> ResponseMsg {
        let Some(sender) = self.bundle(msg.uberjobid) else {
            return ResponseMsg::ok_note("abandoned");
        };
        if sender.on_worker_error() {
            self.on_bundle_failed(msg.uberjobid, msg.to_error()).await;
        }
        ResponseMsg::ok()
    }

    /// Row cap reached: stop remaining work but tell workers to keep files;
    /// bundles that never published a file are simply discarded.
    async fn handle_rowcap(self: &Arc<Self>) {
        info!(
            query_id = self.query_id,
            row_limit = self.spec.row_limit,
            "row cap reached, stopping outstanding bundles"
        );
        let outstanding: Vec<Arc<BundleSender>> = {
            let state = self.state.lock();
            state
                .bundles
                .values()
                .filter(|b| !b.state().is_terminal())
                .cloned()
                .collect()
        };
        for sender in outstanding {
            sender.cancel();
            if let Some(peer) = self.peers.get(&sender.worker_id) {
                peer.add_keep_files(self.query_id);
            }
        }
        self.record_message(
            "dispatcher",
            Severity::Info,
            0,
            format!("row limit {} reached; work truncated", self.spec.row_limit),
        )
        .await;
    }

    /// A bundle reached a failed terminal state; recover per the error's
    /// classification.
    pub async fn on_bundle_failed(self: &Arc<Self>, bundle_id: BundleId, err: CoreError) {
        let Some(sender) = self.bundle(bundle_id) else {
            return;
        };
        if self.state.lock().terminal.is_some() {
            return;
        }
        warn!(
            query_id = self.query_id,
            bundle_id,
            worker_id = %sender.worker_id,
            error = %err,
            "bundle failed"
        );

        let retryable = match err.recovery() {
            Recovery::Retryable => true,
            Recovery::NonRetryable => {
                matches!(err, CoreError::WorkerExecution { .. })
                    && self.config.retry_execution_errors
            }
            Recovery::UserError => false,
        };

        if !retryable {
            self.fail_query(QueryStatus::Failed, Some(err)).await;
            return;
        }

        self.record_message(
            &format!("worker-{}", sender.worker_id),
            Severity::Info,
            err.wire_code(),
            format!("bundle {} failed, reassigning: {}", bundle_id, err),
        )
        .await;

        let mut jobs = sender.take_jobs();
        for job in &mut jobs {
            job.attempt_count += 1;
            if job.attempt_count > self.config.job_attempt_limit {
                self.fail_query(
                    QueryStatus::Failed,
                    Some(CoreError::Internal(format!(
                        "job {} (chunk {}) exceeded {} attempts; last error: {}",
                        job.job_id, job.chunk_id, self.config.job_attempt_limit, err
                    ))),
                )
                .await;
                return;
            }
        }

        if let Err(e) = self.dispatch_jobs(jobs).await {
            // Reassignment itself failed; one more attempt is owed to the
            // budget when the placement or peer comes back, but with no
            // holder for the jobs the query must fail.
            self.fail_query(QueryStatus::Failed, Some(e)).await;
        }
    }

    /// Cancel the query: terminal ABORTED, cancel notices to workers.
    pub async fn cancel(self: &Arc<Self>) {
        self.fail_query(QueryStatus::Aborted, None).await;
    }

    /// The worker went away (liveness timeout or restart). Fail its bundles
    /// locally; transport classification reassigns within the budget.
    pub async fn on_worker_lost(self: &Arc<Self>, worker_id: &WorkerId, reason: &str) {
        let lost: Vec<Arc<BundleSender>> = {
            let state = self.state.lock();
            state
                .bundles
                .values()
                .filter(|b| b.worker_id == *worker_id && !b.state().is_terminal())
                .cloned()
                .collect()
        };
        for sender in lost {
            if sender.on_transport_lost() {
                self.on_bundle_failed(
                    sender.bundle_id,
                    CoreError::Transport(format!("worker {} {}", worker_id, reason)),
                )
                .await;
            }
        }
    }

    /// Write the terminal status exactly once and tear down children.
    async fn fail_query(self: &Arc<Self>, status: QueryStatus, err: Option<CoreError>) {
        let outstanding: Vec<Arc<BundleSender>> = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(status);
            state
                .bundles
                .values()
                .filter(|b| !b.state().is_terminal())
                .cloned()
                .collect()
        };

        for sender in &outstanding {
            if sender.cancel() {
                if let Some(peer) = self.peers.get(&sender.worker_id) {
                    peer.add_dead_bundle(self.query_id, sender.bundle_id);
                }
            }
        }
        for worker_id in self.involved_workers() {
            if let Some(peer) = self.peers.get(&worker_id) {
                peer.add_delete_files(self.query_id);
            }
        }

        if let Some(err) = &err {
            self.record_message("dispatcher", Severity::Error, err.wire_code(), err.to_string())
                .await;
        }

        let (rows, bytes) = {
            let state = self.state.lock();
            (state.collected_rows, state.collected_bytes)
        };
        if let Err(e) = self
            .metadata
            .complete_query(self.query_id, status, rows, bytes, None)
            .await
        {
            error!(query_id = self.query_id, error = %e, "terminal status write failed");
        }
        info!(query_id = self.query_id, status = status.as_str(), "query terminated");
    }

    /// When every bundle is terminal and none failed, run the final merge
    /// phase and complete the query.
    async fn maybe_finish(self: &Arc<Self>) {
        let (rows, bytes, rowcap_hit) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() || state.finishing {
                return;
            }
            if state.bundles.values().any(|b| !b.state().is_terminal()) {
                return;
            }
            state.finishing = true;
            (state.collected_rows, state.collected_bytes, state.rowcap_hit)
        };

        let status = if rowcap_hit && !self.spec.truncatable {
            QueryStatus::FailedRowcap
        } else {
            QueryStatus::Completed
        };

        let final_rows = match self
            .merger
            .run_final_merge(&self.spec.merge_sql, self.query_id, &self.result_table())
            .await
        {
            Ok(final_rows) => final_rows.or(Some(rows)),
            Err(e) => {
                self.state.lock().finishing = false;
                self.fail_query(QueryStatus::Failed, Some(e)).await;
                return;
            }
        };

        if rowcap_hit {
            // The user-facing result query reflects the truncation.
            let limited = format!(
                "SELECT * FROM {} LIMIT {}",
                self.result_table(),
                self.spec.row_limit
            );
            if let Err(e) = self.metadata.update_result_query(self.query_id, &limited).await {
                warn!(query_id = self.query_id, error = %e, "result query update failed");
            }
        }

        {
            let mut state = self.state.lock();
            state.terminal = Some(status);
        }
        for worker_id in self.involved_workers() {
            if let Some(peer) = self.peers.get(&worker_id) {
                peer.add_delete_files(self.query_id);
            }
        }
        if let Err(e) = self
            .metadata
            .complete_query(self.query_id, status, rows, bytes, final_rows)
            .await
        {
            error!(query_id = self.query_id, error = %e, "completion write failed");
        }
        info!(
            query_id = self.query_id,
            status = status.as_str(),
            collected_rows = rows,
            "query finished"
        );
    }
}

/// Per-process coordinator service.
pub struct Coordinator {
    pub identity: CoordinatorIdentity,
    pub config: Arc<CoordinatorConfig>,
    auth: AuthContext,
    metadata: Arc<dyn QueryMetadata>,
    pub messages: Arc<MessageStore>,
    placement: Arc<ChunkPlacement>,
    pub peers: Arc<PeerTracker>,
    merger: Arc<ResultMerger>,
    client: Client,
    dispatchers: DashMap<QueryId, Arc<QueryDispatcher>>,
}

impl Coordinator {
    /// Register in the metadata store, run restart recovery, and assemble
    /// the shared services.
    pub async fn bootstrap(
        config: CoordinatorConfig,
        metadata: Arc<dyn QueryMetadata>,
        result_db: Arc<dyn crate::sql::SqlConnection>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config.clamped());
        let coordinator_id = metadata.register_coordinator(&config.name).await?;
        let recovered = metadata.abort_executing_queries(coordinator_id).await?;
        if recovered > 0 {
            info!(recovered, "aborted queries from a previous run");
        }
        let identity = CoordinatorIdentity::new(coordinator_id, &config);
        let auth = AuthContext {
            instance_id: config.instance_id.clone(),
            auth_key: config.auth_key.clone(),
            admin_auth_key: config.admin_auth_key.clone(),
        };
        let messages = Arc::new(MessageStore::new(Some(metadata.clone())));
        let placement = Arc::new(ChunkPlacement::new(metadata.clone()));
        let merger = ResultMerger::start(config.merge.clone(), result_db);
        Ok(Arc::new(Self {
            identity,
            config,
            auth,
            metadata,
            messages,
            placement,
            peers: Arc::new(PeerTracker::new()),
            merger,
            client: crate::common::http_client(),
            dispatchers: DashMap::new(),
        }))
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn metadata(&self) -> Arc<dyn QueryMetadata> {
        self.metadata.clone()
    }

    pub fn dispatcher(&self, query_id: QueryId) -> Option<Arc<QueryDispatcher>> {
        self.dispatchers.get(&query_id).map(|d| d.clone())
    }

    pub fn active_queries(&self) -> usize {
        self.dispatchers.len()
    }

    /// Journal and launch a query. Failures before the journal write fail
    /// the call synchronously; afterwards they surface through the message
    /// log and the terminal status.
    pub async fn submit(self: &Arc<Self>, spec: QuerySpec) -> Result<QueryId> {
        let query_id = self
            .metadata
            .add_query(NewQuery {
                coordinator_id: self.identity.id,
                user: spec.user.clone(),
                query: spec.sql.clone(),
                chunk_template: spec.chunk_template.clone(),
                merge_sql: spec.merge_sql.clone(),
                result_location: spec.result_location.clone(),
                message_table: spec.message_table.clone(),
                chunk_count: spec.chunk_queries.len() as u32,
                tables: spec.tables.clone(),
            })
            .await?;

        let dispatcher = QueryDispatcher::new_cyclic(
            query_id,
            spec,
            self.config.clone(),
            self.identity.clone(),
            self.auth.clone(),
            self.metadata.clone(),
            self.messages.clone(),
            self.placement.clone(),
            self.peers.clone(),
            self.merger.clone(),
            self.client.clone(),
        );
        self.dispatchers.insert(query_id, dispatcher.clone());

        if let Err(e) = dispatcher.start().await {
            dispatcher.fail_query(QueryStatus::Failed, Some(e)).await;
        }
        Ok(query_id)
    }

    pub async fn cancel(&self, query_id: QueryId) -> Result<()> {
        let dispatcher = self.dispatcher(query_id).ok_or_else(|| {
            CoreError::Internal(format!("query {} is not active", query_id))
        })?;
        dispatcher.cancel().await;
        Ok(())
    }

    /// Route a `/queryjob-ready` callback.
    pub async fn handle_ready(&self, msg: &BundleReadyMsg) -> ResponseMsg {
        if let Err(e) = self.auth.verify(&msg.envelope) {
            return ResponseMsg::err(&e);
        }
        match self.dispatcher(msg.queryid) {
            Some(dispatcher) => {
                dispatcher
                    .on_result_ready(
                        msg.uberjobid,
                        msg.file_url.clone(),
                        msg.row_count,
                        msg.file_size,
                    )
                    .await
            }
            None => ResponseMsg::ok_note("abandoned"),
        }
    }

    /// Route a `/queryjob-error` callback.
    pub async fn handle_worker_error(&self, msg: &BundleErrorMsg) -> ResponseMsg {
        if let Err(e) = self.auth.verify(&msg.envelope) {
            return ResponseMsg::err(&e);
        }
        match self.dispatcher(msg.queryid) {
            Some(dispatcher) => dispatcher.on_worker_error(msg).await,
            None => ResponseMsg::ok_note("abandoned"),
        }
    }

    /// Route a `/workerczarcomissue` message: refresh the peer record and
    /// replay the carried ready-notifications.
    pub async fn handle_com_issue(&self, msg: &ComIssueMsg) -> ComIssueResponse {
        if let Err(e) = self.auth.verify(&msg.envelope) {
            return ComIssueResponse {
                success: 0,
                error: e.to_string(),
                acceptedready: Vec::new(),
            };
        }
        self.peers.upsert(msg.workerinfo.clone());
        if msg.thoughtczarwasdead {
            warn!(worker_id = %msg.workerinfo.id, "worker reports it thought this coordinator was dead");
        }
        let mut accepted = Vec::new();
        for note in &msg.pendingreadymsgs {
            if let Some(dispatcher) = self.dispatcher(note.queryid) {
                let resp = dispatcher
                    .on_result_ready(
                        note.uberjobid,
                        note.file_url.clone(),
                        note.row_count,
                        note.file_size,
                    )
                    .await;
                if resp.is_success() {
                    accepted.push(AcceptedReady {
                        queryid: note.queryid,
                        uberjobid: note.uberjobid,
                    });
                }
            } else {
                // Unknown query: accept so the worker stops resending; its
                // file will be reclaimed by retention.
                accepted.push(AcceptedReady {
                    queryid: note.queryid,
                    uberjobid: note.uberjobid,
                });
            }
        }
        ComIssueResponse {
            success: 1,
            error: String::new(),
            acceptedready: accepted,
        }
    }
}

/// Bridges peer-tracker events into the dispatchers without a strong cycle.
pub struct CoordinatorPeerEvents(pub Weak<Coordinator>);

impl PeerEvents for CoordinatorPeerEvents {
    fn worker_restarted(&self, worker_id: &WorkerId) {
        let Some(coordinator) = self.0.upgrade() else {
            return;
        };
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            let dispatchers: Vec<_> = coordinator
                .dispatchers
                .iter()
                .map(|e| e.value().clone())
                .collect();
            for dispatcher in dispatchers {
                dispatcher.on_worker_lost(&worker_id, "restarted").await;
            }
        });
    }

    fn worker_dead(&self, worker_id: &WorkerId) {
        let Some(coordinator) = self.0.upgrade() else {
            return;
        };
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            let dispatchers: Vec<_> = coordinator
                .dispatchers
                .iter()
                .map(|e| e.value().clone())
                .collect();
            for dispatcher in dispatchers {
                dispatcher.on_worker_lost(&worker_id, "is unresponsive").await;
            }
        });
    }
}
