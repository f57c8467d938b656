// Coordinator-side status-exchange loop.
//
// Every `status_interval` the coordinator POSTs a status message to each
// known worker. The message is built (and the maps compacted) under the
// per-peer lock; the lock is released before the HTTP call. Replies update
// last-touch, remove acknowledged ids, and reveal worker restarts. The
// same tick sweeps liveness and reports newly dead workers to the owner.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::time::interval;
use tracing::{debug, warn};

use super::tracker::{PeerTracker, WorkerPeer};
use crate::common::WorkerId;
use crate::config::PeerConfig;
use crate::error::{CoreError, Result};
use crate::identity::CoordinatorIdentity;
use crate::proto::status::StatusResponse;
use crate::proto::AuthContext;

/// Callbacks by which peer-state changes reach the query dispatchers.
pub trait PeerEvents: Send + Sync {
    /// The worker's startup epoch changed: every bundle assigned to it must
    /// be failed and its jobs reassigned.
    fn worker_restarted(&self, worker_id: &WorkerId);

    /// The worker went silent past the liveness deadline.
    fn worker_dead(&self, worker_id: &WorkerId);
}

pub struct StatusExchange {
    tracker: Arc<PeerTracker>,
    identity: CoordinatorIdentity,
    auth: AuthContext,
    config: PeerConfig,
    client: Client,
    events: Arc<dyn PeerEvents>,
}

impl StatusExchange {
    pub fn new(
        tracker: Arc<PeerTracker>,
        identity: CoordinatorIdentity,
        auth: AuthContext,
        config: PeerConfig,
        events: Arc<dyn PeerEvents>,
    ) -> Self {
        Self {
            tracker,
            identity,
            auth,
            config,
            client: crate::common::http_client(),
            events,
        }
    }

    /// Periodic loop; exits when the tracker is cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.status_interval_secs));
        let cancel = self.tracker.cancel_flag();
        loop {
            ticker.tick().await;
            if cancel.is_cancelled() {
                debug!("status exchange loop cancelled");
                return;
            }
            self.tick().await;
        }
    }

    /// One full round: liveness sweep plus an exchange with each live peer.
    pub async fn tick(&self) {
        for worker_id in self
            .tracker
            .sweep_dead(Duration::from_secs(self.config.dead_after_secs))
        {
            self.events.worker_dead(&worker_id);
        }

        for peer in self.tracker.peers() {
            if !peer.is_alive() {
                continue;
            }
            if let Err(e) = self.exchange_with(&peer).await {
                warn!(worker_id = %peer.worker_id, error = %e, "status exchange failed");
            }
        }
    }

    /// Exchange with one worker. Public for tests and for forced resync.
    pub async fn exchange_with(&self, peer: &Arc<WorkerPeer>) -> Result<()> {
        let msg = peer.build_status(
            self.auth.envelope(),
            self.identity.contact(),
            Duration::from_secs(self.config.entry_max_lifetime_secs),
            None,
        );
        let url = format!("{}/workerstatus", peer.contact().base_url());

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.http_timeout_secs))
            .json(&msg)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CoreError::Transport(format!(
                "workerstatus returned HTTP {}",
                response.status()
            )));
        }
        let reply: StatusResponse = response.json().await?;
        if !reply.is_success() {
            return Err(CoreError::Transport(format!(
                "workerstatus rejected: {}",
                reply.error
            )));
        }
        if peer.apply_response(&reply) {
            self.events.worker_restarted(&peer.worker_id);
        }
        Ok(())
    }
}
