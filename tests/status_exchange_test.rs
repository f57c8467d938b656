// The periodic status exchange and the com-issue recovery path, run over
// real HTTP against real peers.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use scatterdb::config::{CoordinatorConfig, PeerConfig, WorkerConfig};
use scatterdb::coordinator::{self, Coordinator};
use scatterdb::identity::CoordinatorIdentity;
use scatterdb::metadata::MemMetadataStore;
use scatterdb::peering::{PeerEvents, PeerTracker, StatusExchange};
use scatterdb::proto::status::ReadyNote;
use scatterdb::proto::AuthContext;
use scatterdb::sql::MockSqlConnection;
use scatterdb::worker::{self, WorkerService};
use scatterdb::WorkerId;

struct NoEvents;

impl PeerEvents for NoEvents {
    fn worker_restarted(&self, _worker_id: &WorkerId) {}
    fn worker_dead(&self, _worker_id: &WorkerId) {}
}

async fn spawn_worker() -> (Arc<WorkerService>, TempDir) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();
    let config = WorkerConfig {
        worker_id: "w1".to_string(),
        host: "127.0.0.1".to_string(),
        port,
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        result_dir: dir.path().display().to_string(),
        ..WorkerConfig::default()
    };
    let service = WorkerService::new(config, Arc::new(MockSqlConnection::new()))
        .await
        .unwrap();
    let router = worker::http::router(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (service, dir)
}

fn auth() -> AuthContext {
    AuthContext {
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        admin_auth_key: "admin".to_string(),
    }
}

#[tokio::test]
async fn acknowledged_notices_leave_the_tracker_empty() {
    let (worker, _dir) = spawn_worker().await;

    let tracker = Arc::new(PeerTracker::new());
    let peer = tracker.upsert(worker.identity.contact());
    peer.add_delete_files(33);
    peer.add_keep_files(34);
    peer.add_dead_bundle(35, 2);
    assert!(!peer.maps_empty());

    let config = CoordinatorConfig {
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        admin_auth_key: "admin".to_string(),
        ..CoordinatorConfig::default()
    };
    let identity = CoordinatorIdentity::new(1, &config);
    let exchange = StatusExchange::new(
        tracker.clone(),
        identity,
        auth(),
        PeerConfig::default(),
        Arc::new(NoEvents),
    );
    exchange.exchange_with(&peer).await.unwrap();

    // Everything the worker acknowledged is gone and the peer is fresh.
    assert!(peer.maps_empty());
    assert!(peer.is_alive());
    assert_eq!(
        peer.contact().startup_epoch,
        worker.identity.startup_epoch
    );
}

#[tokio::test]
async fn exchange_detects_a_worker_restart() {
    let (worker, _dir) = spawn_worker().await;

    let tracker = Arc::new(PeerTracker::new());
    let mut stale = worker.identity.contact();
    // The coordinator remembers the epoch of the previous incarnation.
    stale.startup_epoch = worker.identity.startup_epoch - 1000;
    let peer = tracker.upsert(stale);
    peer.add_keep_files(1);

    struct CountRestarts(std::sync::atomic::AtomicUsize);
    impl PeerEvents for CountRestarts {
        fn worker_restarted(&self, _worker_id: &WorkerId) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn worker_dead(&self, _worker_id: &WorkerId) {}
    }
    let events = Arc::new(CountRestarts(std::sync::atomic::AtomicUsize::new(0)));

    let config = CoordinatorConfig {
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        ..CoordinatorConfig::default()
    };
    let exchange = StatusExchange::new(
        tracker.clone(),
        CoordinatorIdentity::new(1, &config),
        auth(),
        PeerConfig::default(),
        events.clone(),
    );
    exchange.exchange_with(&peer).await.unwrap();

    assert_eq!(events.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    // Restart discards the per-peer maps.
    assert!(peer.maps_empty());
}

#[tokio::test]
async fn com_issue_clears_after_coordinator_ack() {
    // A live coordinator endpoint for the worker to call back.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cz_port = listener.local_addr().unwrap().port();
    let config = CoordinatorConfig {
        name: "cz-test".to_string(),
        host: "127.0.0.1".to_string(),
        port: cz_port,
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        ..CoordinatorConfig::default()
    };
    let store = Arc::new(MemMetadataStore::new());
    let cz = Coordinator::bootstrap(config, store, Arc::new(MockSqlConnection::new()))
        .await
        .unwrap();
    let router = coordinator::http::router(cz.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let (worker, _dir) = spawn_worker().await;
    worker.start();
    let (peer, _) = worker.czars.upsert(cz.identity.contact());
    peer.queue_undelivered_ready(ReadyNote {
        queryid: 999,
        uberjobid: 1,
        file_url: "http://127.0.0.1:1/results/qr_1_999_1.rows".to_string(),
        row_count: 10,
        file_size: 80,
    });
    assert!(peer.com_issue_payload().is_some());

    worker.send_com_issue_if_needed(cz.identity.id).await;

    // The coordinator accepted the unknown-query note so the worker stops
    // resending it.
    tokio::time::timeout(Duration::from_secs(5), async {
        while peer.com_issue_payload().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pending com-issue entries were not cleared");
}
