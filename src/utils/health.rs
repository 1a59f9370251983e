//! Background health probing.
//!
//! One cycle probes every backend sequentially with a plain `GET` against the
//! configured health path, classifies it alive only on an exact 200, and
//! publishes liveness transitions through the pool so that parked request
//! handlers wake as soon as a backend recovers. Successful probes also feed
//! their round-trip time into the selection strategy's latency model.
//!
//! The first cycle is run synchronously from `main` before the server starts
//! accepting requests; afterwards `health_check_loop` reruns it on a ticker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::metrics::{HEALTHCHECK_FAILED, HEALTHY_BACKENDS, HEALTH_CHECK_LATENCY};
use crate::pool::BackendPool;

/// Drives periodic health cycles until the shutdown signal fires.
pub async fn health_check_loop(
    pool: Arc<BackendPool>,
    client: Client,
    cfg: Arc<Config>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = interval(cfg.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The startup cycle already ran synchronously; skip the immediate tick so
    // the next probe lands one full interval later.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("health checker received shutdown signal, exiting");
                return;
            }
            _ = ticker.tick() => {
                perform_health_check_cycle(&pool, &client, &cfg).await;
            }
        }
    }
}

/// Runs one round of probes over every backend, in pool order.
///
/// Probes happen without any pool lock held; only the per-backend transition
/// publication takes it, briefly.
pub async fn perform_health_check_cycle(pool: &BackendPool, client: &Client, cfg: &Config) {
    debug!("performing health checks");
    for backend in pool.backends() {
        let (alive, duration) =
            probe_backend(client, backend, &cfg.health_check_path, cfg.backend_request_timeout)
                .await;

        if alive != backend.is_alive() {
            if alive {
                info!(url = %backend.url(), "backend transitioned to UP");
            } else {
                warn!(url = %backend.url(), "backend transitioned to DOWN");
            }
            pool.mark_backend_status(backend.url(), alive);
        }

        if !alive {
            HEALTHCHECK_FAILED.with_label_values(&[backend.url().as_str()]).inc();
        } else if !duration.is_zero() {
            pool.update_response_time(backend, duration);
        }
    }

    let healthy = pool.backends().iter().filter(|b| b.is_alive()).count();
    HEALTHY_BACKENDS.set(healthy as i64);
}

/// One probe: `GET {backend}{health_path}` bounded by `timeout`.
///
/// Returns the observed liveness and the elapsed time, measured whether or
/// not the probe succeeded.
async fn probe_backend(
    client: &Client,
    backend: &Backend,
    health_path: &str,
    timeout: Duration,
) -> (bool, Duration) {
    let probe_url = backend.endpoint_url(health_path);
    let started = Instant::now();
    let result = client.get(&probe_url).timeout(timeout).send().await;
    let duration = started.elapsed();

    HEALTH_CHECK_LATENCY
        .with_label_values(&[backend.url().as_str()])
        .observe(duration.as_secs_f64());

    // Anything but an exact 200 within the timeout counts as dead.
    let alive = matches!(&result, Ok(response) if response.status() == StatusCode::OK);
    (alive, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, Config};
    use crate::forwarder::Forwarder;
    use crate::strategy;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use url::Url;

    async fn spawn_backend(router: Router) -> SocketAddr {
        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
            .serve(router.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn test_config() -> Config {
        let mut cfg = Config::for_tests();
        cfg.backend_request_timeout = Duration::from_millis(500);
        cfg
    }

    fn pool_for(url: &Url, algorithm: Algorithm) -> BackendPool {
        let cfg = test_config();
        let mut pool = BackendPool::new(strategy::for_algorithm(algorithm, cfg.ewma_alpha));
        let backend =
            Backend::new(url.clone(), Forwarder::new(reqwest::Client::new(), url.clone()), 1);
        pool.add_backend(backend);
        pool
    }

    #[tokio::test]
    async fn healthy_probe_marks_alive_and_seeds_ewma() {
        let addr = spawn_backend(Router::new().route("/health", get(|| async { "ok" }))).await;
        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let pool = pool_for(&url, Algorithm::LeastResponseTime);
        let cfg = test_config();

        perform_health_check_cycle(&pool, &reqwest::Client::new(), &cfg).await;

        let backend = &pool.backends()[0];
        assert!(backend.is_alive());
        assert!(backend.ewma_nanos() >= 1);
    }

    #[tokio::test]
    async fn repeated_healthy_probes_keep_backend_alive() {
        let addr = spawn_backend(Router::new().route("/health", get(|| async { "ok" }))).await;
        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let pool = pool_for(&url, Algorithm::LeastResponseTime);
        let cfg = test_config();
        let client = reqwest::Client::new();

        perform_health_check_cycle(&pool, &client, &cfg).await;
        perform_health_check_cycle(&pool, &client, &cfg).await;

        let backend = &pool.backends()[0];
        assert!(backend.is_alive());
        assert!(backend.ewma_nanos() >= 1);
    }

    #[tokio::test]
    async fn non_200_probe_marks_backend_dead() {
        let addr = spawn_backend(Router::new().route(
            "/health",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "draining") }),
        ))
        .await;
        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let pool = pool_for(&url, Algorithm::RoundRobin);
        pool.backends()[0].set_alive(true);
        let cfg = test_config();

        perform_health_check_cycle(&pool, &reqwest::Client::new(), &cfg).await;

        assert!(!pool.backends()[0].is_alive());
    }

    #[tokio::test]
    async fn unreachable_backend_is_marked_dead() {
        // Grab a port that nothing listens on any more.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let pool = pool_for(&url, Algorithm::RoundRobin);
        pool.backends()[0].set_alive(true);
        let cfg = test_config();

        perform_health_check_cycle(&pool, &reqwest::Client::new(), &cfg).await;

        assert!(!pool.backends()[0].is_alive());
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown_signal() {
        let url = Url::parse("http://127.0.0.1:9091").unwrap();
        let pool = Arc::new(pool_for(&url, Algorithm::RoundRobin));
        let cfg = Arc::new(test_config());
        let (tx, rx) = watch::channel(());

        let handle = tokio::spawn(health_check_loop(pool, reqwest::Client::new(), cfg, rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not exit on shutdown")
            .unwrap();
    }
}
