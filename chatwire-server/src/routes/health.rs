use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use crate::{app_state::AppState, db::bootstrap};

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    /// Live relay sockets, reported by `/readyz`.
    #[serde(skip_serializing_if = "Option::is_none")]
    connections: Option<usize>,
}

fn record(endpoint: &'static str, status: &'static str) {
    metrics::counter!("health_checks_total", "endpoint" => endpoint, "status" => status)
        .increment(1);
}

async fn healthz() -> impl IntoResponse {
    record("healthz", "ok");
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            connections: None,
        }),
    )
}

/// Ready when the chat log backend answers.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = match state.pool.as_ref() {
        Some(pool) => bootstrap::ensure_readiness(pool)
            .await
            .map_err(|err| err.to_string()),
        None => state
            .chat
            .history_reader()
            .bus()
            .backend()
            .logs()
            .await
            .map(|_| ())
            .map_err(|err| err.to_string()),
    };

    let connections = Some(state.fanout.len().await);
    match ready {
        Ok(()) => {
            record("readyz", "ok");
            (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "ready",
                    connections,
                }),
            )
        }
        Err(err) => {
            warn!(error = %err, "readiness check failed");
            record("readyz", "error");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    connections,
                }),
            )
        }
    }
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
