// Worker HTTP surface: bundle acceptance, status exchange, result files.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::WorkerService;
use crate::error::{CoreError, Result};
use crate::proto::bundle::BundleMsg;
use crate::proto::status::{StatusMsg, StatusResponse};
use crate::proto::ResponseMsg;

pub fn router(service: Arc<WorkerService>) -> Router {
    // Generous deadline: result-file pulls are long-lived streams, unlike
    // the control messages bounded by the peer timeout.
    let request_deadline = std::time::Duration::from_secs(3600);
    Router::new()
        .route("/queryjob", post(queryjob))
        .route("/workerstatus", post(worker_status))
        .route("/results/{name}", get(result_file))
        .route("/status", get(status_info))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_deadline)),
        )
        .with_state(service)
}

pub async fn serve(service: Arc<WorkerService>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CoreError::Config(format!("cannot bind {}: {}", addr, e)))?;
    info!(addr, "worker HTTP listening");
    axum::serve(listener, router(service))
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

async fn queryjob(
    State(service): State<Arc<WorkerService>>,
    Json(msg): Json<BundleMsg>,
) -> Json<ResponseMsg> {
    match service.accept_bundle(msg).await {
        Ok(()) => Json(ResponseMsg::ok()),
        Err(e) => Json(ResponseMsg::err(&e)),
    }
}

async fn worker_status(
    State(service): State<Arc<WorkerService>>,
    Json(msg): Json<StatusMsg>,
) -> Json<StatusResponse> {
    Json(service.handle_status(&msg).await)
}

/// Stream one ready result file. 404 once the worker has reclaimed it.
async fn result_file(
    State(service): State<Arc<WorkerService>>,
    Path(name): Path<String>,
) -> Response {
    match service.files.open_ready(&name).await {
        Ok((file, len)) => {
            let stream = async_stream::stream! {
                let mut file = file;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match file.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => yield Ok::<_, std::io::Error>(bytes::Bytes::copy_from_slice(&buf[..n])),
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    }
                }
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, len)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn status_info(State(service): State<Arc<WorkerService>>) -> Json<Value> {
    Json(json!({
        "success": 1,
        "worker_id": &service.identity.id,
        "startup_epoch": service.identity.startup_epoch,
        "queue_len": service.scheduler.queue_len(),
        "counters": &service.scheduler.counters,
        "coordinators": service
            .czars
            .peers()
            .iter()
            .map(|p| json!({
                "coordinator_id": p.coordinator_id,
                "alive": p.is_alive(),
            }))
            .collect::<Vec<_>>(),
    }))
}
