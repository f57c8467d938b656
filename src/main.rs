// # ScatterDB Coordinator
//
// Main entry point for the coordinator process. Registers with the
// metadata store, recovers queries left over from a previous run, starts
// the status-exchange and garbage-collection loops, and serves the worker
// callback endpoints.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use scatterdb::config::{load_or_default, CoordinatorConfig};
use scatterdb::coordinator::dispatcher::CoordinatorPeerEvents;
use scatterdb::coordinator::{http, Coordinator};
use scatterdb::gc::CoordinatorGc;
use scatterdb::metadata::{MemMetadataStore, QueryMetadata, SqlMetadataStore};
use scatterdb::peering::StatusExchange;
use scatterdb::{Result, VERSION};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "coordinator failed");
            log::warn!("coordinator stopped with error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    info!(version = VERSION, "starting scatterdb coordinator");

    let config_path = std::env::var("SCATTERDB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("scatterdb-coordinator.json"));
    let config: CoordinatorConfig = load_or_default(&config_path)?;

    let metadata: Arc<dyn QueryMetadata> = if config.metadata_uri.starts_with("mock://") {
        Arc::new(MemMetadataStore::new())
    } else {
        let conn = scatterdb::sql::connect(&config.metadata_uri)?;
        Arc::new(SqlMetadataStore::open(conn).await?)
    };
    let result_db = scatterdb::sql::connect(&config.result_db_uri)?;

    let coordinator = Coordinator::bootstrap(config, metadata.clone(), result_db.clone()).await?;
    info!(
        coordinator_id = coordinator.identity.id,
        startup_epoch = coordinator.identity.startup_epoch,
        "coordinator registered"
    );

    let exchange = Arc::new(StatusExchange::new(
        coordinator.peers.clone(),
        coordinator.identity.clone(),
        coordinator.auth().clone(),
        coordinator.config.peer.clone(),
        Arc::new(CoordinatorPeerEvents(Arc::downgrade(&coordinator))),
    ));
    tokio::spawn(exchange.run());

    CoordinatorGc::new(
        metadata,
        result_db,
        coordinator.messages.clone(),
        coordinator.config.retention.clone(),
        coordinator.config.result_db.clone(),
    )
    .spawn();

    let addr = format!("0.0.0.0:{}", coordinator.config.port);
    http::serve(coordinator, &addr).await
}
