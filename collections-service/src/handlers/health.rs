use crate::services::metrics::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness probe. Does not touch dependencies.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "collections-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness probe: database and due-queue must answer.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.ledger.health_check().await;
    let queue = state.scheduler.health_check().await;

    match (&database, &queue) {
        (Ok(_), Ok(_)) => {
            tracing::debug!("Readiness check passed");
            (StatusCode::OK, Json(json!({ "status": "ready" })))
        }
        _ => {
            tracing::warn!(
                database = ?database.as_ref().err().map(|e| e.to_string()),
                queue = ?queue.as_ref().err().map(|e| e.to_string()),
                "Readiness check failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "database": database.is_ok(),
                    "queue": queue.is_ok()
                })),
            )
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
