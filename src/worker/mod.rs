// # Worker Side
//
// The worker accepts job bundles from coordinators, executes each chunk
// fragment against its local MySQL instance, streams rows into per-bundle
// result files, serves those files over HTTP, and keeps every coordinator
// informed through async callbacks and the periodic status exchange.

pub mod files;
pub mod http;
pub mod receiver;
pub mod runner;
pub mod scheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tracing::{info, warn};

use crate::common::{BundleId, CoordinatorId, QueryId};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::identity::WorkerIdentity;
use crate::peering::{ContactOutcome, CoordinatorTracker};
use crate::proto::status::{DeadBundles, StatusMsg, StatusResponse};
use crate::proto::AuthContext;
use crate::sql::SqlConnection;

pub use files::{result_file_name, ResultFileStore};
pub use receiver::{BundleKey, BundleOutcome, TaskState, WorkerBundle, WorkerTask};
pub use scheduler::TaskScheduler;

pub struct WorkerService {
    pub identity: WorkerIdentity,
    pub config: WorkerConfig,
    auth: AuthContext,
    pub(crate) sql: Arc<dyn SqlConnection>,
    pub files: Arc<ResultFileStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub czars: Arc<CoordinatorTracker>,
    pub(crate) bundles: DashMap<BundleKey, Arc<WorkerBundle>>,
    pub(crate) client: Client,
    next_task_id: AtomicU64,
}

impl WorkerService {
    pub async fn new(config: WorkerConfig, sql: Arc<dyn SqlConnection>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = config.clamped();
        let identity = WorkerIdentity::new(&config);
        let auth = AuthContext {
            instance_id: config.instance_id.clone(),
            auth_key: config.auth_key.clone(),
            admin_auth_key: String::new(),
        };
        let files = Arc::new(ResultFileStore::new(config.result_dir.clone()));
        if config.create_result_dir {
            files.ensure_dir().await?;
        }
        Ok(Arc::new(Self {
            identity,
            config,
            auth,
            sql,
            files,
            scheduler: Arc::new(TaskScheduler::new()),
            czars: Arc::new(CoordinatorTracker::new()),
            bundles: DashMap::new(),
            client: crate::common::http_client(),
            next_task_id: AtomicU64::new(0),
        }))
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Spawn the task pool, the coordinator liveness sweep, and the local
    /// file retention loop.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.config.task_pool_size {
            let service = self.clone();
            tokio::spawn(async move {
                loop {
                    let task = service.scheduler.next().await;
                    service.run_task(task).await;
                }
            });
        }

        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                service.config.peer.status_interval_secs,
            ));
            loop {
                ticker.tick().await;
                for czar_id in service
                    .czars
                    .sweep_dead(Duration::from_secs(service.config.peer.dead_after_secs))
                {
                    service.on_coordinator_dead(czar_id).await;
                }
            }
        });

        let service = self.clone();
        tokio::spawn(async move {
            let retention =
                Duration::from_secs(service.config.retention.worker_file_retention_secs);
            let mut ticker = tokio::time::interval(retention.max(Duration::from_secs(60)));
            loop {
                ticker.tick().await;
                let removed = service.files.sweep_older_than(retention).await;
                if removed > 0 {
                    info!(removed, "expired result files reclaimed");
                }
            }
        });
    }

    /// Liveness timeout on a coordinator: cancel its incomplete work and
    /// drop unpublished partial files. Published files stay for pickup once
    /// the coordinator returns (or until retention).
    async fn on_coordinator_dead(&self, czar_id: CoordinatorId) {
        warn!(coordinator_id = czar_id, "cancelling work for unresponsive coordinator");
        for bundle in self.bundles_for_czar(czar_id) {
            if !bundle.is_published() {
                bundle.request_cancel(true);
            }
        }
    }

    /// Handle one inbound status-exchange message and build the reply.
    pub async fn handle_status(self: &Arc<Self>, msg: &StatusMsg) -> StatusResponse {
        if let Err(e) = self.auth.verify(&msg.envelope) {
            return StatusResponse {
                success: 0,
                error: e.to_string(),
                reqid: msg.reqid,
                startup_epoch: self.identity.startup_epoch,
                ackedkeepfiles: Vec::new(),
                ackeddeletefiles: Vec::new(),
                ackeddeaduberjobs: Vec::new(),
            };
        }

        let czar_id = msg.czarinfo.id;
        let (peer, outcome) = self.czars.upsert(msg.czarinfo.clone());
        if outcome == ContactOutcome::Restarted {
            self.on_coordinator_restart(czar_id).await;
        }
        if let Some(restart) = &msg.czarrestart {
            if restart.czarid == czar_id {
                self.on_coordinator_restart(czar_id).await;
            }
        }

        if msg.thoughtworkerwasdead {
            // The coordinator lost track of us; re-announce every published
            // but unacknowledged file through the com-issue path.
            for bundle in self.bundles_for_czar(czar_id) {
                if bundle.is_published() && !bundle.is_acked() {
                    peer.queue_undelivered_ready(self.ready_note(&bundle));
                }
            }
        }

        let mut acked_keep = Vec::new();
        for qid in &msg.qiddonekeepfiles {
            self.cancel_query(czar_id, *qid, false).await;
            acked_keep.push(*qid);
        }
        let mut acked_delete = Vec::new();
        for qid in &msg.qiddonedeletefiles {
            self.cancel_query(czar_id, *qid, true).await;
            acked_delete.push(*qid);
        }
        let mut acked_dead = Vec::new();
        for dead in &msg.qiddeaduberjobs {
            let mut acked = Vec::new();
            for ujid in &dead.ujids {
                self.cancel_bundle(czar_id, dead.qid, *ujid).await;
                acked.push(*ujid);
            }
            acked_dead.push(DeadBundles {
                qid: dead.qid,
                ujids: acked,
            });
        }

        // Deliver any queued com-issue traffic now that contact works.
        let service = self.clone();
        tokio::spawn(async move {
            service.send_com_issue_if_needed(czar_id).await;
        });

        StatusResponse {
            success: 1,
            error: String::new(),
            reqid: msg.reqid,
            startup_epoch: self.identity.startup_epoch,
            ackedkeepfiles: acked_keep,
            ackeddeletefiles: acked_delete,
            ackeddeaduberjobs: acked_dead,
        }
    }

    /// A coordinator restarted: everything tied to its previous incarnation
    /// is void, including result files.
    async fn on_coordinator_restart(&self, czar_id: CoordinatorId) {
        warn!(coordinator_id = czar_id, "coordinator restart: discarding its work");
        let keys: Vec<BundleKey> = self
            .bundles
            .iter()
            .filter(|e| e.key().0 == czar_id)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            if let Some(bundle) = self.bundle(&key) {
                bundle.request_cancel(true);
                if bundle.is_published() {
                    self.files.remove(&bundle.file_name).await;
                    self.drop_bundle(&key);
                }
            }
        }
    }

    /// Stop all tasks of a query; optionally reclaim its files.
    pub async fn cancel_query(&self, czar_id: CoordinatorId, query_id: QueryId, delete_files: bool) {
        for bundle in self.bundles_for_query(czar_id, query_id) {
            bundle.request_cancel(delete_files);
            if delete_files && bundle.is_published() {
                self.files.remove(&bundle.file_name).await;
                self.drop_bundle(&(czar_id, query_id, bundle.bundle_id));
            }
        }
        if delete_files {
            // Sweep files whose bundle entry is already gone.
            self.files.remove_query_files(czar_id, query_id).await;
        }
    }

    /// Abandon one bundle and reclaim its file.
    pub async fn cancel_bundle(&self, czar_id: CoordinatorId, query_id: QueryId, bundle_id: BundleId) {
        let key = (czar_id, query_id, bundle_id);
        if let Some(bundle) = self.bundle(&key) {
            bundle.request_cancel(true);
            if bundle.is_published() {
                self.files.remove(&bundle.file_name).await;
                self.drop_bundle(&key);
            }
        }
    }
}
