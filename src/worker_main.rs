// # ScatterDB Worker
//
// Main entry point for the worker process. Opens the local SQL surface,
// prepares the result-file directory, starts the task pool and retention
// loops, and serves the coordinator-facing endpoints.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};

use scatterdb::config::{load_or_default, WorkerConfig};
use scatterdb::worker::{http, WorkerService};
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
            error!(error = %e, "worker failed");
            log::warn!("worker stopped with error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    info!(version = VERSION, "starting scatterdb worker");

    let config_path = std::env::var("SCATTERDB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("scatterdb-worker.json"));
    let config: WorkerConfig = load_or_default(&config_path)?;

    let sql = scatterdb::sql::connect(&config.mysql_uri)?;
    let service = WorkerService::new(config, sql).await?;
    info!(
        worker_id = %service.identity.id,
        startup_epoch = service.identity.startup_epoch,
        "worker ready"
    );
    service.start();

    let addr = format!("0.0.0.0:{}", service.config.port);
    http::serve(service, &addr).await
}
