//! The reverse-proxy transport bound to one backend.
//!
//! A [`Forwarder`] rewrites an inbound request onto its target URL, relays it
//! through the shared HTTP client, and hands back status, headers, and body.
//! It reports transport failures as [`ForwardError`]; deciding what a failure
//! means for the backend's liveness is the caller's job.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Headers that are connection-scoped and must not be relayed end to end.
/// Host is dropped too; the client derives it from the target URL.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        // Unwrap is fine: every entry is a valid lowercase header name.
        let name = HeaderName::from_static(name);
        while headers.remove(&name).is_some() {}
    }
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    target: Url,
}

impl Forwarder {
    pub fn new(client: Client, target: Url) -> Self {
        Self { client, target }
    }

    /// Relays one request to the target backend.
    ///
    /// The inbound path and query are appended to the target URL verbatim, so
    /// every path the proxy receives maps one-to-one onto the backend.
    pub async fn serve(
        &self,
        method: Method,
        path_and_query: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ForwardError> {
        let upstream_url =
            format!("{}{}", self.target.as_str().trim_end_matches('/'), path_and_query);

        strip_hop_by_hop(&mut headers);

        let response = self
            .client
            .request(method, &upstream_url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        let response_body = response.bytes().await?;

        Ok((status, response_headers, response_body))
    }
}
