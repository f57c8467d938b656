// Coordinator HTTP surface.
//
// Worker-facing callbacks plus read-only operational endpoints. Every
// state-changing response is the uniform JSON envelope; its embedded
// `success` field is authoritative regardless of HTTP status.

use std::collections::HashMap;
use std::sync::Arc;

use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::dispatcher::Coordinator;
use crate::error::{CoreError, Result};
use crate::proto::notify::{BundleErrorMsg, BundleReadyMsg};
use crate::proto::status::{ComIssueMsg, ComIssueResponse};
use crate::proto::ResponseMsg;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let request_deadline = Duration::from_secs(coordinator.config.peer.http_timeout_secs);
    Router::new()
        .route("/queryjob-ready", post(queryjob_ready))
        .route("/queryjob-error", post(queryjob_error))
        .route("/workerczarcomissue", post(worker_com_issue))
        .route("/config", get(config_info))
        .route("/status", get(status_info))
        .route("/query-progress", get(query_progress))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_deadline)),
        )
        .with_state(coordinator)
}

/// Bind and serve until the process exits.
pub async fn serve(coordinator: Arc<Coordinator>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CoreError::Config(format!("cannot bind {}: {}", addr, e)))?;
    info!(addr, "coordinator HTTP listening");
    axum::serve(listener, router(coordinator))
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

async fn queryjob_ready(
    State(coordinator): State<Arc<Coordinator>>,
    Json(msg): Json<BundleReadyMsg>,
) -> Json<ResponseMsg> {
    Json(coordinator.handle_ready(&msg).await)
}

async fn queryjob_error(
    State(coordinator): State<Arc<Coordinator>>,
    Json(msg): Json<BundleErrorMsg>,
) -> Json<ResponseMsg> {
    Json(coordinator.handle_worker_error(&msg).await)
}

async fn worker_com_issue(
    State(coordinator): State<Arc<Coordinator>>,
    Json(msg): Json<ComIssueMsg>,
) -> Json<ComIssueResponse> {
    Json(coordinator.handle_com_issue(&msg).await)
}

async fn config_info(State(coordinator): State<Arc<Coordinator>>) -> Json<Value> {
    let config = &coordinator.config;
    // Auth material never leaves the process.
    Json(json!({
        "success": 1,
        "config": {
            "name": &config.name,
            "host": &config.host,
            "port": config.port,
            "instance_id": &config.instance_id,
            "result_db": &config.result_db,
            "bundle_max_jobs": config.bundle_max_jobs,
            "job_attempt_limit": config.job_attempt_limit,
            "retry_execution_errors": config.retry_execution_errors,
            "peer": &config.peer,
            "merge": &config.merge,
            "retention": &config.retention,
        }
    }))
}

async fn status_info(State(coordinator): State<Arc<Coordinator>>) -> Json<Value> {
    let peers: Vec<Value> = coordinator
        .peers
        .peers()
        .into_iter()
        .map(|p| {
            let contact = p.contact();
            json!({
                "worker_id": &p.worker_id,
                "alive": p.is_alive(),
                "host": contact.management_host,
                "port": contact.management_port,
                "startup_epoch": contact.startup_epoch,
            })
        })
        .collect();
    Json(json!({
        "success": 1,
        "coordinator_id": coordinator.identity.id,
        "name": &coordinator.identity.name,
        "startup_epoch": coordinator.identity.startup_epoch,
        "active_queries": coordinator.active_queries(),
        "workers": peers,
    }))
}

async fn query_progress(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let Some(query_id) = params.get("queryid").and_then(|v| v.parse::<u64>().ok()) else {
        return Json(json!({"success": 0, "error": "missing or bad queryid"}));
    };
    match coordinator.metadata().progress(query_id).await {
        Ok(Some(progress)) => Json(json!({"success": 1, "progress": progress})),
        Ok(None) => Json(json!({"success": 1, "progress": Value::Null})),
        Err(e) => Json(json!({"success": 0, "error": e.to_string()})),
    }
}
