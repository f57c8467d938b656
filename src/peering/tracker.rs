use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::common::{BundleId, CancelFlag, CoordinatorId, QueryId, WorkerId};
use crate::proto::status::{
    CoordinatorContact, DeadBundles, ReadyNote, StatusMsg, StatusResponse, WorkerContact,
};

/// Outcome of folding a peer's latest contact block into its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    /// Nothing notable; epoch unchanged, peer was already alive.
    Normal,
    /// The peer's startup epoch changed: it restarted. All per-peer state
    /// was discarded, only contact info kept.
    Restarted,
    /// The peer was marked DEAD and has come back; the next outbound
    /// message must carry the resync flag.
    BackFromDead,
}

/// The three per-peer notice maps, with per-entry insertion times so that
/// compaction can drop entries older than the configured maximum lifetime.
#[derive(Debug, Default)]
pub struct PeerMaps {
    keep_files: HashMap<QueryId, Instant>,
    delete_files: HashMap<QueryId, Instant>,
    dead_bundles: HashMap<QueryId, HashMap<BundleId, Instant>>,
}

impl PeerMaps {
    pub fn add_keep_files(&mut self, query_id: QueryId, now: Instant) {
        self.keep_files.entry(query_id).or_insert(now);
    }

    /// A whole-query delete supersedes individual dead-bundle notices.
    pub fn add_delete_files(&mut self, query_id: QueryId, now: Instant) {
        self.delete_files.entry(query_id).or_insert(now);
        self.dead_bundles.remove(&query_id);
    }

    pub fn add_dead_bundle(&mut self, query_id: QueryId, bundle_id: BundleId, now: Instant) {
        self.dead_bundles
            .entry(query_id)
            .or_default()
            .entry(bundle_id)
            .or_insert(now);
    }

    /// Drop entries older than `max_age`.
    pub fn compact(&mut self, now: Instant, max_age: Duration) {
        self.keep_files.retain(|_, t| now.duration_since(*t) <= max_age);
        self.delete_files.retain(|_, t| now.duration_since(*t) <= max_age);
        for bundles in self.dead_bundles.values_mut() {
            bundles.retain(|_, t| now.duration_since(*t) <= max_age);
        }
        self.dead_bundles.retain(|_, bundles| !bundles.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.keep_files.is_empty() && self.delete_files.is_empty() && self.dead_bundles.is_empty()
    }

    pub fn keep_files_wire(&self) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self.keep_files.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn delete_files_wire(&self) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self.delete_files.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn dead_bundles_wire(&self) -> Vec<DeadBundles> {
        let mut entries: Vec<DeadBundles> = self
            .dead_bundles
            .iter()
            .map(|(qid, bundles)| {
                let mut ujids: Vec<BundleId> = bundles.keys().copied().collect();
                ujids.sort_unstable();
                DeadBundles { qid: *qid, ujids }
            })
            .collect();
        entries.sort_by_key(|e| e.qid);
        entries
    }

    /// Remove entries the peer acknowledged acting on.
    pub fn apply_acks(&mut self, resp: &StatusResponse) {
        for qid in &resp.ackedkeepfiles {
            self.keep_files.remove(qid);
        }
        for qid in &resp.ackeddeletefiles {
            self.delete_files.remove(qid);
        }
        for acked in &resp.ackeddeaduberjobs {
            if let Some(bundles) = self.dead_bundles.get_mut(&acked.qid) {
                for ujid in &acked.ujids {
                    bundles.remove(ujid);
                }
                if bundles.is_empty() {
                    self.dead_bundles.remove(&acked.qid);
                }
            }
        }
    }
}

struct WorkerPeerState {
    contact: WorkerContact,
    last_touch: Instant,
    alive: bool,
    thought_peer_was_dead: bool,
    maps: PeerMaps,
    /// Next outbound status-exchange request id.
    next_reqid: u64,
    /// Highest reply id already applied; duplicate replies are no-ops.
    applied_reqid: u64,
}

/// Coordinator-side record of one worker.
pub struct WorkerPeer {
    pub worker_id: WorkerId,
    state: Mutex<WorkerPeerState>,
}

impl WorkerPeer {
    pub fn new(contact: WorkerContact) -> Self {
        Self {
            worker_id: contact.id.clone(),
            state: Mutex::new(WorkerPeerState {
                contact,
                last_touch: Instant::now(),
                alive: true,
                thought_peer_was_dead: false,
                maps: PeerMaps::default(),
                next_reqid: 1,
                applied_reqid: 0,
            }),
        }
    }

    pub fn contact(&self) -> WorkerContact {
        self.state.lock().contact.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    /// Fold in a fresh contact observation (registry update or reply).
    pub fn note_contact(&self, observed: &WorkerContact) -> ContactOutcome {
        let mut state = self.state.lock();
        state.last_touch = Instant::now();
        let outcome = if observed.startup_epoch != 0
            && state.contact.startup_epoch != 0
            && observed.startup_epoch != state.contact.startup_epoch
        {
            // Restart: keep only contact info.
            state.maps = PeerMaps::default();
            state.thought_peer_was_dead = false;
            ContactOutcome::Restarted
        } else if !state.alive {
            state.thought_peer_was_dead = true;
            ContactOutcome::BackFromDead
        } else {
            ContactOutcome::Normal
        };
        state.contact = observed.clone();
        state.alive = true;
        outcome
    }

    /// Returns true if this call transitioned the peer to DEAD.
    pub fn mark_if_dead(&self, dead_after: Duration) -> bool {
        let mut state = self.state.lock();
        if state.alive && state.last_touch.elapsed() > dead_after {
            state.alive = false;
            warn!(worker_id = %self.worker_id, "worker marked dead");
            return true;
        }
        false
    }

    pub fn add_keep_files(&self, query_id: QueryId) {
        self.state.lock().maps.add_keep_files(query_id, Instant::now());
    }

    pub fn add_delete_files(&self, query_id: QueryId) {
        self.state.lock().maps.add_delete_files(query_id, Instant::now());
    }

    pub fn add_dead_bundle(&self, query_id: QueryId, bundle_id: BundleId) {
        self.state
            .lock()
            .maps
            .add_dead_bundle(query_id, bundle_id, Instant::now());
    }

    /// Build the outbound status message, compacting the maps in the same
    /// step. The per-peer lock is released before any I/O happens.
    pub fn build_status(
        &self,
        envelope: crate::proto::Envelope,
        czarinfo: CoordinatorContact,
        max_entry_age: Duration,
        czarrestart: Option<crate::proto::status::RestartedCoordinator>,
    ) -> StatusMsg {
        let mut state = self.state.lock();
        state.maps.compact(Instant::now(), max_entry_age);
        let reqid = state.next_reqid;
        state.next_reqid += 1;
        let msg = StatusMsg {
            envelope,
            reqid,
            czarinfo,
            workerinfo: state.contact.clone(),
            qiddonekeepfiles: state.maps.keep_files_wire(),
            qiddonedeletefiles: state.maps.delete_files_wire(),
            qiddeaduberjobs: state.maps.dead_bundles_wire(),
            thoughtworkerwasdead: state.thought_peer_was_dead,
            czarrestart,
        };
        state.thought_peer_was_dead = false;
        msg
    }

    /// Apply the worker's reply. Returns true when the reply revealed a
    /// worker restart (startup epoch advanced), in which case per-peer
    /// state has been discarded. A duplicate reply (request id already
    /// applied) only refreshes liveness.
    pub fn apply_response(&self, resp: &StatusResponse) -> bool {
        let mut state = self.state.lock();
        state.last_touch = Instant::now();
        state.alive = true;
        if resp.reqid != 0 && resp.reqid <= state.applied_reqid {
            return false;
        }
        state.applied_reqid = state.applied_reqid.max(resp.reqid);
        let restarted = state.contact.startup_epoch != 0
            && resp.startup_epoch != 0
            && resp.startup_epoch != state.contact.startup_epoch;
        if restarted {
            info!(worker_id = %self.worker_id, "worker restart detected via status reply");
            state.maps = PeerMaps::default();
        } else {
            state.maps.apply_acks(resp);
        }
        state.contact.startup_epoch = resp.startup_epoch;
        restarted
    }

    pub fn maps_empty(&self) -> bool {
        self.state.lock().maps.is_empty()
    }
}

/// Coordinator-side tracker: one [`WorkerPeer`] per known worker.
pub struct PeerTracker {
    peers: DashMap<WorkerId, Arc<WorkerPeer>>,
    cancel: CancelFlag,
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTracker {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn upsert(&self, contact: WorkerContact) -> Arc<WorkerPeer> {
        if let Some(peer) = self.peers.get(&contact.id) {
            peer.note_contact(&contact);
            return peer.clone();
        }
        let peer = Arc::new(WorkerPeer::new(contact.clone()));
        self.peers.insert(contact.id, peer.clone());
        peer
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<WorkerPeer>> {
        self.peers.get(worker_id).map(|p| p.clone())
    }

    pub fn peers(&self) -> Vec<Arc<WorkerPeer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Sweep liveness; returns workers that just transitioned to DEAD.
    pub fn sweep_dead(&self, dead_after: Duration) -> Vec<WorkerId> {
        self.peers
            .iter()
            .filter(|e| e.value().mark_if_dead(dead_after))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

struct CoordinatorPeerState {
    contact: CoordinatorContact,
    last_touch: Instant,
    alive: bool,
    thought_peer_was_dead: bool,
    pending_ready: Vec<ReadyNote>,
}

/// Worker-side record of one coordinator.
pub struct CoordinatorPeer {
    pub coordinator_id: CoordinatorId,
    state: Mutex<CoordinatorPeerState>,
}

impl CoordinatorPeer {
    pub fn new(contact: CoordinatorContact) -> Self {
        Self {
            coordinator_id: contact.id,
            state: Mutex::new(CoordinatorPeerState {
                contact,
                last_touch: Instant::now(),
                alive: true,
                thought_peer_was_dead: false,
                pending_ready: Vec::new(),
            }),
        }
    }

    pub fn contact(&self) -> CoordinatorContact {
        self.state.lock().contact.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn note_contact(&self, observed: &CoordinatorContact) -> ContactOutcome {
        let mut state = self.state.lock();
        state.last_touch = Instant::now();
        let outcome = if observed.startup_epoch != 0
            && state.contact.startup_epoch != 0
            && observed.startup_epoch != state.contact.startup_epoch
        {
            state.pending_ready.clear();
            state.thought_peer_was_dead = false;
            ContactOutcome::Restarted
        } else if !state.alive {
            state.thought_peer_was_dead = true;
            ContactOutcome::BackFromDead
        } else {
            ContactOutcome::Normal
        };
        state.contact = observed.clone();
        state.alive = true;
        outcome
    }

    pub fn mark_if_dead(&self, dead_after: Duration) -> bool {
        let mut state = self.state.lock();
        if state.alive && state.last_touch.elapsed() > dead_after {
            state.alive = false;
            state.thought_peer_was_dead = true;
            warn!(coordinator_id = self.coordinator_id, "coordinator marked dead");
            return true;
        }
        false
    }

    /// Queue a ready notification that failed to deliver; it rides the next
    /// com-issue message.
    pub fn queue_undelivered_ready(&self, note: ReadyNote) {
        let mut state = self.state.lock();
        if !state
            .pending_ready
            .iter()
            .any(|n| n.queryid == note.queryid && n.uberjobid == note.uberjobid)
        {
            state.pending_ready.push(note);
        }
    }

    /// Whether a com-issue message should be sent, and its payload.
    pub fn com_issue_payload(&self) -> Option<(bool, Vec<ReadyNote>)> {
        let state = self.state.lock();
        if !state.thought_peer_was_dead && state.pending_ready.is_empty() {
            return None;
        }
        Some((state.thought_peer_was_dead, state.pending_ready.clone()))
    }

    /// Clear com-issue state the coordinator acknowledged.
    pub fn apply_com_issue_ack(&self, accepted: &[(QueryId, BundleId)]) {
        let mut state = self.state.lock();
        state
            .pending_ready
            .retain(|n| !accepted.contains(&(n.queryid, n.uberjobid)));
        if state.pending_ready.is_empty() {
            state.thought_peer_was_dead = false;
        }
    }
}

/// Worker-side tracker: one [`CoordinatorPeer`] per coordinator with
/// current business.
#[derive(Default)]
pub struct CoordinatorTracker {
    peers: DashMap<CoordinatorId, Arc<CoordinatorPeer>>,
}

impl CoordinatorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: CoordinatorContact) -> (Arc<CoordinatorPeer>, ContactOutcome) {
        if let Some(peer) = self.peers.get(&contact.id) {
            let outcome = peer.note_contact(&contact);
            return (peer.clone(), outcome);
        }
        let peer = Arc::new(CoordinatorPeer::new(contact.clone()));
        self.peers.insert(contact.id, peer.clone());
        (peer, ContactOutcome::Normal)
    }

    pub fn get(&self, id: CoordinatorId) -> Option<Arc<CoordinatorPeer>> {
        self.peers.get(&id).map(|p| p.clone())
    }

    pub fn peers(&self) -> Vec<Arc<CoordinatorPeer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn sweep_dead(&self, dead_after: Duration) -> Vec<CoordinatorId> {
        self.peers
            .iter()
            .filter(|e| e.value().mark_if_dead(dead_after))
            .map(|e| *e.key())
            .collect()
    }
}
