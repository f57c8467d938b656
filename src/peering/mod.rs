// # Peer Tracking
//
// Each process keeps one record per remote peer it has current business
// with: the coordinator tracks workers, the worker tracks coordinators.
// A record carries contact info, the last observed startup epoch, the time
// of the last successful round-trip, and the three notice maps that ride
// the periodic status exchange. Liveness, restart detection, and the
// post-gap re-synchronisation flag all live here.

pub mod exchange;
pub mod tracker;

pub use exchange::{PeerEvents, StatusExchange};
pub use tracker::{
    ContactOutcome, CoordinatorPeer, CoordinatorTracker, PeerMaps, PeerTracker, WorkerPeer,
};
