//! Core data structures: the `Backend` record describing one upstream server
//! and the state the selection strategies hang off it, plus the top-level
//! `BalancerError` enum.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use url::Url;

use crate::config::ConfigError;
use crate::forwarder::Forwarder;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid listen address: {0}")]
    ListenAddr(#[from] std::net::AddrParseError),
}

/// One upstream HTTP server the proxy may dispatch to.
///
/// The URL and weight are fixed at construction; liveness and the
/// per-strategy counters are mutated concurrently by request handlers and the
/// health prober. All accessors are safe for unsynchronised callers.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    forwarder: Forwarder,
    alive: AtomicBool,
    weight: u32,
    /// In-flight requests currently proxied to this backend. Incremented and
    /// decremented by the dispatch path, read by least-connections.
    active_connections: AtomicI64,
    /// EWMA of health-probe round trips in nanoseconds. Zero means no sample
    /// has been recorded yet; once sampled the value stays >= 1.
    ewma_response_time_ns: AtomicU64,
    /// Smooth-WRR scheduling state. The lock keeps the increment/compare and
    /// the post-selection decrement paired.
    pub(crate) current_weight: Mutex<i64>,
}

impl Backend {
    /// Creates a backend in the dead state; the first health cycle decides
    /// whether it enters the rotation.
    pub fn new(url: Url, forwarder: Forwarder, weight: u32) -> Self {
        Self {
            url,
            forwarder,
            alive: AtomicBool::new(false),
            weight,
            active_connections: AtomicI64::new(0),
            ewma_response_time_ns: AtomicU64::new(0),
            current_weight: Mutex::new(0),
        }
    }

    /// The parser-normalised URL; its string form is the backend's identity.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn ewma_nanos(&self) -> u64 {
        self.ewma_response_time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn store_ewma_nanos(&self, nanos: u64) {
        self.ewma_response_time_ns.store(nanos, Ordering::Relaxed);
    }

    /// Appends a path such as `/health` to the backend URL string. Mirrors
    /// how the prober and status collector address per-backend endpoints.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.url.as_str().trim_end_matches('/'), path)
    }
}

/// RAII pairing of `inc_active`/`dec_active` around one dispatch.
///
/// Least-connections silently degrades toward round-robin behaviour when the
/// counter is not paired exactly once per request, so the handler creates one
/// of these before invoking the forwarder and lets Drop cover every exit
/// path, errors included.
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn new(backend: Arc<Backend>) -> Self {
        backend.inc_active();
        Self { backend }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_active();
    }
}
