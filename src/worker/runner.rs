// Task execution and coordinator notification.
//
// One task streams the rows of its expanded fragment statements into the
// bundle's result file. There is no per-task retry here: any MySQL error
// fails the task, the bundle aggregates task errors into a single
// bundle-level error message, and retry is the coordinator's prerogative.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::receiver::{BundleOutcome, TaskState, WorkerBundle, WorkerTask};
use super::WorkerService;
use crate::common::CoordinatorId;
use crate::error::CoreError;
use crate::proto::notify::{BundleErrorMsg, BundleReadyMsg};
use crate::proto::status::{ComIssueMsg, ComIssueResponse, ReadyNote};
use crate::proto::ResponseMsg;

impl WorkerService {
    pub(crate) async fn run_task(self: &Arc<Self>, task: Arc<WorkerTask>) {
        let counters = &self.scheduler.counters;
        let bundle = task.bundle.clone();

        if bundle.cancel.is_cancelled() {
            task.set_state(TaskState::Cancelled);
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            self.task_done(&bundle).await;
            return;
        }

        task.set_state(TaskState::Running);
        counters.running.fetch_add(1, Ordering::Relaxed);
        let outcome = self.execute_task(&task, &bundle).await;
        counters.running.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            TaskState::Complete => counters.completed.fetch_add(1, Ordering::Relaxed),
            TaskState::Failed => counters.failed.fetch_add(1, Ordering::Relaxed),
            _ => counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };
        task.set_state(outcome);
        self.task_done(&bundle).await;
    }

    /// Stream every statement's rows into the bundle file. Returns the
    /// task's terminal state.
    async fn execute_task(&self, task: &WorkerTask, bundle: &Arc<WorkerBundle>) -> TaskState {
        for sql in &task.statements {
            if bundle.cancel.is_cancelled() {
                return TaskState::Cancelled;
            }
            let mut stream = match self.sql.query_stream(sql).await {
                Ok(stream) => stream,
                Err(e) => {
                    let (errno, message) = sql_error_parts(&e);
                    bundle.note_error(errno, message);
                    return TaskState::Failed;
                }
            };
            while let Some(row) = stream.next().await {
                if bundle.cancel.is_cancelled() {
                    return TaskState::Cancelled;
                }
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        let (errno, message) = sql_error_parts(&e);
                        bundle.note_error(errno, message);
                        return TaskState::Failed;
                    }
                };
                {
                    let mut writer = bundle.writer.lock().await;
                    let Some(writer) = writer.as_mut() else {
                        // Sink already closed by a cancel path.
                        return TaskState::Cancelled;
                    };
                    if let Err(e) = writer.write_row(&row.0).await {
                        bundle.note_error(e.wire_code(), e.to_string());
                        return TaskState::Failed;
                    }
                }
                if !bundle.note_rows(1) {
                    debug!(
                        task_id = task.task_id,
                        chunk_id = task.chunk_id,
                        "per-bundle row cap reached, stopping read"
                    );
                    return TaskState::Complete;
                }
            }
        }
        TaskState::Complete
    }

    async fn task_done(self: &Arc<Self>, bundle: &Arc<WorkerBundle>) {
        if let Some(outcome) = bundle.task_finished() {
            self.finalize_bundle(bundle.clone(), outcome).await;
        }
    }

    /// Last task of the bundle ended: publish, report failure, or clean up.
    async fn finalize_bundle(self: &Arc<Self>, bundle: Arc<WorkerBundle>, outcome: BundleOutcome) {
        match outcome {
            BundleOutcome::Publish { rowcap_hit } => {
                let writer = bundle.writer.lock().await.take();
                let Some(writer) = writer else {
                    return;
                };
                let file_size = match writer.finish().await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(
                            query_id = bundle.query_id,
                            bundle_id = bundle.bundle_id,
                            error = %e,
                            "result file close failed"
                        );
                        self.send_error(&bundle, e.wire_code(), e.to_string()).await;
                        return;
                    }
                };
                if let Err(e) = self.files.publish(&bundle.file_name).await {
                    self.send_error(&bundle, e.wire_code(), e.to_string()).await;
                    return;
                }
                bundle.mark_published();
                info!(
                    query_id = bundle.query_id,
                    bundle_id = bundle.bundle_id,
                    rows = bundle.rows_written(),
                    file_size,
                    rowcap_hit,
                    "bundle result published"
                );
                self.send_ready(&bundle, file_size).await;
            }
            BundleOutcome::Failed { errno, message } => {
                let _ = bundle.writer.lock().await.take();
                self.files.remove(&bundle.file_name).await;
                self.send_error(&bundle, errno, message).await;
            }
            BundleOutcome::Cancelled { delete_file } => {
                let _ = bundle.writer.lock().await.take();
                if delete_file || !bundle.is_published() {
                    self.files.remove(&bundle.file_name).await;
                }
                debug!(
                    query_id = bundle.query_id,
                    bundle_id = bundle.bundle_id,
                    "bundle cancelled"
                );
            }
        }
    }

    pub(crate) fn ready_note(&self, bundle: &WorkerBundle) -> ReadyNote {
        ReadyNote {
            queryid: bundle.query_id,
            uberjobid: bundle.bundle_id,
            file_url: self.file_url(&bundle.file_name),
            row_count: bundle.rows_written(),
            file_size: 0,
        }
    }

    fn file_url(&self, file_name: &str) -> String {
        format!(
            "http://{}:{}/results/{}",
            self.identity.host, self.identity.port, file_name
        )
    }

    /// Announce a ready result file. Delivery failures queue the
    /// notification for the next com-issue round instead of retrying here.
    async fn send_ready(self: &Arc<Self>, bundle: &Arc<WorkerBundle>, file_size: u64) {
        let msg = BundleReadyMsg {
            envelope: self.auth().envelope(),
            workerid: self.identity.id.clone(),
            czar: bundle.czar.name.clone(),
            czarid: bundle.czar.id,
            queryid: bundle.query_id,
            uberjobid: bundle.bundle_id,
            file_url: self.file_url(&bundle.file_name),
            row_count: bundle.rows_written(),
            file_size,
        };
        let url = format!(
            "http://{}:{}/queryjob-ready",
            bundle.czar.management_host, bundle.czar.management_port
        );
        match self.post_envelope(&url, &msg).await {
            Ok(resp) if resp.is_success() => {
                bundle.mark_acked();
                if resp.note.as_deref() == Some("abandoned") {
                    // The coordinator no longer wants this result.
                    self.files.remove(&bundle.file_name).await;
                    self.drop_bundle(&(bundle.czar.id, bundle.query_id, bundle.bundle_id));
                }
            }
            Ok(resp) => {
                warn!(
                    query_id = bundle.query_id,
                    bundle_id = bundle.bundle_id,
                    error = %resp.error,
                    "coordinator rejected ready notification"
                );
            }
            Err(e) => {
                warn!(
                    query_id = bundle.query_id,
                    bundle_id = bundle.bundle_id,
                    error = %e,
                    "ready notification failed; queued for com-issue"
                );
                let mut note = self.ready_note(bundle);
                note.file_size = file_size;
                if let Some(peer) = self.czars.get(bundle.czar.id) {
                    peer.queue_undelivered_ready(note);
                }
            }
        }
    }

    async fn send_error(self: &Arc<Self>, bundle: &Arc<WorkerBundle>, errno: i32, message: String) {
        let msg = BundleErrorMsg {
            envelope: self.auth().envelope(),
            workerid: self.identity.id.clone(),
            czar: bundle.czar.name.clone(),
            czarid: bundle.czar.id,
            queryid: bundle.query_id,
            uberjobid: bundle.bundle_id,
            error_code: CoreError::WorkerExecution {
                errno,
                message: String::new(),
            }
            .wire_code(),
            error_msg: format!("errno {}: {}", errno, message),
        };
        let url = format!(
            "http://{}:{}/queryjob-error",
            bundle.czar.management_host, bundle.czar.management_port
        );
        if let Err(e) = self.post_envelope(&url, &msg).await {
            warn!(
                query_id = bundle.query_id,
                bundle_id = bundle.bundle_id,
                error = %e,
                "error notification failed"
            );
        }
    }

    /// Send the queued com-issue message for `czar_id`, if any.
    pub async fn send_com_issue_if_needed(self: &Arc<Self>, czar_id: CoordinatorId) {
        let Some(peer) = self.czars.get(czar_id) else {
            return;
        };
        let Some((thought_dead, pending)) = peer.com_issue_payload() else {
            return;
        };
        let contact = peer.contact();
        let msg = ComIssueMsg {
            envelope: self.auth().envelope(),
            workerinfo: self.identity.contact(),
            czarid: czar_id,
            thoughtczarwasdead: thought_dead,
            pendingreadymsgs: pending,
        };
        let url = format!(
            "http://{}:{}/workerczarcomissue",
            contact.management_host, contact.management_port
        );
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.peer.http_timeout_secs))
            .json(&msg)
            .send()
            .await;
        let reply: ComIssueResponse = match response {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(coordinator_id = czar_id, error = %e, "bad com-issue reply");
                    return;
                }
            },
            Ok(resp) => {
                warn!(coordinator_id = czar_id, status = %resp.status(), "com-issue rejected");
                return;
            }
            Err(e) => {
                warn!(coordinator_id = czar_id, error = %e, "com-issue send failed");
                return;
            }
        };
        if reply.success == 1 {
            let accepted: Vec<_> = reply
                .acceptedready
                .iter()
                .map(|a| (a.queryid, a.uberjobid))
                .collect();
            for (queryid, uberjobid) in &accepted {
                if let Some(bundle) = self.bundle(&(czar_id, *queryid, *uberjobid)) {
                    bundle.mark_acked();
                }
            }
            peer.apply_com_issue_ack(&accepted);
        }
    }

    async fn post_envelope<T: serde::Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> crate::error::Result<ResponseMsg> {
        let response = self
            .client
            .post(url)
            .timeout(Duration::from_secs(self.config.peer.http_timeout_secs))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CoreError::Transport(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(response.json::<ResponseMsg>().await?)
    }
}

fn sql_error_parts(e: &CoreError) -> (i32, String) {
    match e {
        CoreError::WorkerExecution { errno, message } => (*errno, message.clone()),
        other => (other.wire_code(), other.to_string()),
    }
}
