//! Builds the /status payload: per-backend pool state plus whatever each
//! backend reports on its own info endpoint.

use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::debug;

use crate::backend::Backend;
use crate::config::Config;
use crate::pool::BackendPool;

#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub alive: bool,
    pub weight: u32,
    pub active_connections: i64,
    pub ewma_response_time_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_error: Option<String>,
}

/// Snapshots every backend and fetches its info endpoint concurrently.
/// Results come back in pool order regardless of fetch completion order.
pub async fn collect_statuses(
    pool: &BackendPool,
    client: &Client,
    cfg: &Config,
) -> Vec<BackendStatus> {
    let mut tasks = JoinSet::new();
    for (index, backend) in pool.backends().iter().enumerate() {
        let backend = Arc::clone(backend);
        let client = client.clone();
        let info_path = cfg.info_path.clone();
        let timeout = cfg.backend_request_timeout;
        tasks.spawn(async move {
            let mut status = BackendStatus {
                url: backend.url().to_string(),
                alive: backend.is_alive(),
                weight: backend.weight(),
                active_connections: backend.active_connections(),
                ewma_response_time_ns: backend.ewma_nanos(),
                info: None,
                info_error: None,
            };
            fetch_info(&client, &backend, &info_path, timeout, &mut status).await;
            (index, status)
        });
    }

    let mut collected = Vec::with_capacity(pool.len());
    while let Some(joined) = tasks.join_next().await {
        if let Ok(entry) = joined {
            collected.push(entry);
        }
    }
    collected.sort_by_key(|(index, _)| *index);
    collected.into_iter().map(|(_, status)| status).collect()
}

async fn fetch_info(
    client: &Client,
    backend: &Backend,
    info_path: &str,
    timeout: std::time::Duration,
    status: &mut BackendStatus,
) {
    let info_url = backend.endpoint_url(info_path);
    let response = match client.get(&info_url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %info_url, error = %e, "info request failed");
            status.info_error = Some(format!("info request failed: {e}"));
            return;
        }
    };

    let http_status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            status.info_error = Some(format!("failed to read info body: {e}"));
            return;
        }
    };

    if http_status != reqwest::StatusCode::OK {
        status.info_error = Some(format!(
            "info endpoint returned status {}, body: {}",
            http_status.as_u16(),
            String::from_utf8_lossy(&body)
        ));
        return;
    }

    match serde_json::from_slice::<Value>(&body) {
        Ok(parsed) => status.info = Some(parsed),
        Err(e) => {
            // Keep the raw payload visible even when it is not JSON.
            status.info = Some(Value::String(String::from_utf8_lossy(&body).into_owned()));
            status.info_error = Some(format!("info body is not valid JSON: {e}"));
        }
    }
}
