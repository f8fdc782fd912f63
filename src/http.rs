//! HTTP adapter over [`Gateway`].

use crate::gateway::Gateway;
use crate::Error;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/events", post(submit_event))
        .route("/events/stats", get(stats))
        .route("/health", get(health))
        .with_state(gateway)
}

async fn submit_event(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    match gateway.submit_json(&body).await {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let report = gateway.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn stats(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(gateway.stats()).into_response()
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "success": false,
        "error": error.to_string(),
    });
    (status, Json(body)).into_response()
}
