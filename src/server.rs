//! HTTP serving surface: the catch-all proxy handler plus the /status and
//! /metrics introspection routes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::backend::ConnectionGuard;
use crate::config::Config;
use crate::metrics::{
    NO_BACKEND_AVAILABLE, PROXY_REQUESTS_FAILED, PROXY_REQUESTS_FORWARDED, PROXY_REQUESTS_TOTAL,
};
use crate::pool::BackendPool;
use crate::status;

/// Nginx's non-standard code for "the client went away before we answered".
const CLIENT_CLOSED_REQUEST: u16 = 499;

pub struct AppState {
    pub pool: Arc<BackendPool>,
    pub config: Arc<Config>,
    pub client: Client,
}

/// Builds the application router. Every path except the two introspection
/// routes is proxied to the backend pool.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_proxy)
        .with_state(state)
}

/// Relays one inbound request onto a healthy backend.
///
/// Waits up to the backend request timeout for a healthy backend (503 if none
/// appears), pairs the connection counter around the dispatch, and translates
/// transport failures into a dead mark plus a 502. There is no retry onto
/// another backend.
async fn handle_proxy(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    PROXY_REQUESTS_TOTAL.inc();

    let (parts, body) = request.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // The inbound stream broke; the client is gone, the backend is
            // untouched and keeps its liveness.
            debug!(error = %e, "client aborted while sending request body");
            return client_closed_response();
        }
    };

    let wait = state.config.backend_request_timeout;
    let Some(backend) = state.pool.get_next(wait).await else {
        NO_BACKEND_AVAILABLE.inc();
        warn!(
            method = %parts.method,
            path = %parts.uri.path(),
            waited_ms = wait.as_millis() as u64,
            "no healthy backend available"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response();
    };

    if state.config.access_log {
        info!(
            method = %parts.method,
            path = %parts.uri.path(),
            backend = %backend.url(),
            "forwarding request"
        );
        if state.config.access_log_payloads {
            debug!(body = %String::from_utf8_lossy(&body), "request payload");
        }
    }

    let path_and_query =
        parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_owned();

    let _connection = ConnectionGuard::new(Arc::clone(&backend));
    match backend.forwarder().serve(parts.method, &path_and_query, parts.headers, body).await {
        Ok((status, headers, response_body)) => {
            PROXY_REQUESTS_FORWARDED.with_label_values(&[backend.url().as_str()]).inc();
            if state.config.access_log && state.config.access_log_payloads {
                debug!(body = %String::from_utf8_lossy(&response_body), "response payload");
            }
            (status, headers, response_body).into_response()
        }
        Err(e) => {
            PROXY_REQUESTS_FAILED.with_label_values(&[backend.url().as_str()]).inc();
            error!(backend = %backend.url(), error = %e, "forwarding failed");
            state.pool.mark_backend_status(backend.url(), false);
            (StatusCode::BAD_GATEWAY, "Bad gateway").into_response()
        }
    }
}

fn client_closed_response() -> Response {
    let status =
        StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, "Client closed request").into_response()
}

/// Reports per-backend health, counters, and each backend's own /info data.
async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses = status::collect_statuses(&state.pool, &state.client, &state.config).await;
    axum::Json(statuses)
}

/// Prometheus text exposition of the process metrics.
async fn handle_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                format!("metrics encoding failed: {e}").into_bytes(),
            )
        }
    }
}
