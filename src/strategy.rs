//! Backend selection strategies.
//!
//! Keeping the *how an upstream is chosen* out of the pool module makes each
//! algorithm swappable and testable in isolation. Every strategy sees the
//! same backend list snapshot (the call happens under the pool's selection
//! lock) and must return an alive backend or nothing, without blocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::Backend;
use crate::config::{Algorithm, DEFAULT_EWMA_ALPHA};

/// Contract shared by all selection algorithms.
///
/// `select` may mutate the strategy's own scheduling state and per-backend
/// strategy state, nothing else. `update_response_time` is fed by the health
/// prober after each successful probe; strategies that do not track latency
/// keep the default no-op.
pub trait Strategy: Send + Sync {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn update_response_time(&self, _backend: &Backend, _duration: Duration) {}
}

/// Builds the strategy selected in the configuration and logs the choice.
pub fn for_algorithm(algorithm: Algorithm, ewma_alpha: f64) -> Box<dyn Strategy> {
    match algorithm {
        Algorithm::RoundRobin => {
            info!("using selection strategy: round-robin");
            Box::new(RoundRobin::new())
        }
        Algorithm::LeastConnections => {
            info!("using selection strategy: least-connections");
            Box::new(LeastConnections)
        }
        Algorithm::LeastResponseTime => {
            info!(alpha = ewma_alpha, "using selection strategy: least-response-time");
            Box::new(LeastResponseTime::new(ewma_alpha))
        }
        Algorithm::WeightedRoundRobin => {
            info!("using selection strategy: weighted-round-robin");
            Box::new(WeightedRoundRobin)
        }
    }
}

/// Classic round-robin over the alive subset.
///
/// The cursor is atomic; concurrent selections may skew the rotation but can
/// never hand out a dead backend.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { cursor: AtomicUsize::new(0) }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobin {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let n = backends.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for i in 0..n {
            let idx = (start + i) % n;
            if backends[idx].is_alive() {
                self.cursor.store((idx + 1) % n, Ordering::Relaxed);
                return Some(Arc::clone(&backends[idx]));
            }
        }
        None
    }
}

/// Picks the alive backend with the fewest in-flight requests; ties go to
/// insertion order.
pub struct LeastConnections;

impl Strategy for LeastConnections {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut selected: Option<&Arc<Backend>> = None;
        let mut min_connections = i64::MAX;
        for backend in backends {
            if !backend.is_alive() {
                continue;
            }
            let connections = backend.active_connections();
            if selected.is_none() || connections < min_connections {
                selected = Some(backend);
                min_connections = connections;
            }
        }
        selected.map(Arc::clone)
    }
}

/// Prefers the alive backend with the lowest smoothed probe latency.
///
/// Backends that have never been sampled (EWMA of zero) win over sampled
/// ones so they receive traffic and bootstrap a measurement.
pub struct LeastResponseTime {
    alpha: f64,
}

impl LeastResponseTime {
    pub fn new(alpha: f64) -> Self {
        if alpha <= 0.0 || alpha > 1.0 {
            tracing::warn!(
                alpha,
                fallback = DEFAULT_EWMA_ALPHA,
                "invalid EWMA smoothing factor, using default"
            );
            return Self { alpha: DEFAULT_EWMA_ALPHA };
        }
        Self { alpha }
    }
}

impl Strategy for LeastResponseTime {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut selected: Option<&Arc<Backend>> = None;
        let mut min_ewma = 0u64;
        for backend in backends {
            if !backend.is_alive() {
                continue;
            }
            let ewma = backend.ewma_nanos();
            let better = match selected {
                None => true,
                // Unsampled beats sampled; among sampled the smaller value
                // wins; equal values keep the earlier backend.
                Some(_) => {
                    if ewma == 0 {
                        min_ewma > 0
                    } else {
                        min_ewma > 0 && ewma < min_ewma
                    }
                }
            };
            if better {
                selected = Some(backend);
                min_ewma = ewma;
            }
        }
        selected.map(Arc::clone)
    }

    fn update_response_time(&self, backend: &Backend, duration: Duration) {
        let measurement = (duration.as_nanos() as u64).max(1);
        let old = backend.ewma_nanos();
        let new = if old == 0 {
            measurement
        } else {
            (self.alpha * measurement as f64 + (1.0 - self.alpha) * old as f64) as u64
        };
        // A concurrent update may overwrite this sample; last writer wins.
        backend.store_ewma_nanos(new.max(1));
    }
}

/// Smooth weighted round-robin in the Nginx style.
///
/// Each selection raises every participating backend's `current_weight` by
/// its static weight, hands the request to the highest, and charges the
/// winner the total, which interleaves heavy and light backends instead of
/// bursting. Backends with a zero weight sit out and have their scheduling
/// state reset so they re-enter cleanly if reweighted.
pub struct WeightedRoundRobin;

impl Strategy for WeightedRoundRobin {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut selected: Option<&Arc<Backend>> = None;
        let mut max_current = i64::MIN;
        let mut total: i64 = 0;

        for backend in backends {
            if backend.is_alive() && backend.weight() > 0 {
                let mut current = backend.current_weight.lock();
                *current += i64::from(backend.weight());
                total += i64::from(backend.weight());
                if *current >= max_current {
                    max_current = *current;
                    selected = Some(backend);
                }
            } else if backend.is_alive() {
                *backend.current_weight.lock() = 0;
            }
        }

        let selected = selected?;
        *selected.current_weight.lock() -= total;
        Some(Arc::clone(selected))
    }
}
