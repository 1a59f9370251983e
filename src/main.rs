//! Reverse-proxy load balancer entry point.
//!
//! Responsibilities:
//! 1. Parse CLI flags (with env fallbacks) and layer them over the TOML file.
//! 2. Build the strategy, the shared HTTP client, and the backend pool.
//! 3. Run the first health cycle synchronously, then start the probe loop.
//! 4. Serve the proxy plus `/status` and `/metrics`, and shut down cleanly on
//!    `Ctrl+C` or `SIGTERM`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use reqwest::Client;
use tokio::signal;
use tracing::{error, info};

use pivot_balancer::backend::{Backend, BalancerError};
use pivot_balancer::config::{Overrides, RawConfig};
use pivot_balancer::forwarder::Forwarder;
use pivot_balancer::health;
use pivot_balancer::metrics::TOTAL_BACKENDS;
use pivot_balancer::pool::BackendPool;
use pivot_balancer::server::{router, AppState};
use pivot_balancer::shutdown::ShutdownCoordinator;
use pivot_balancer::strategy;

/// Command-line interface. Every flag can also come from the environment, so
/// the effective precedence is defaults < file < env < flags.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "balancer.toml", env = "PIVOT_CONFIG")]
    config: String,

    /// Listen address for the proxy (e.g. 0.0.0.0:8080).
    #[arg(long, env = "PIVOT_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Comma-separated backend URLs.
    #[arg(long, env = "PIVOT_BACKENDS", value_delimiter = ',')]
    backends: Option<Vec<String>>,

    /// Comma-separated backend weights (weighted-round-robin only).
    #[arg(long, env = "PIVOT_WEIGHTS", value_delimiter = ',')]
    weights: Option<Vec<u32>>,

    /// Path probed on each backend to decide liveness.
    #[arg(long, env = "PIVOT_HEALTH_PATH")]
    health_path: Option<String>,

    /// Path fetched from each backend for the /status report.
    #[arg(long, env = "PIVOT_INFO_PATH")]
    info_path: Option<String>,

    /// Seconds between health-check cycles.
    #[arg(long, env = "PIVOT_HEALTH_INTERVAL_SECS")]
    health_interval_secs: Option<u64>,

    /// Per-request timeout against backends, in milliseconds.
    #[arg(long, env = "PIVOT_BACKEND_TIMEOUT_MS")]
    backend_timeout_ms: Option<u64>,

    /// Selection algorithm: round-robin, least-connections,
    /// least-response-time, weighted-round-robin.
    #[arg(long, env = "PIVOT_LB_ALGORITHM")]
    lb_algorithm: Option<String>,

    /// EWMA smoothing factor in (0, 1] for least-response-time.
    #[arg(long, env = "PIVOT_EWMA_ALPHA")]
    ewma_alpha: Option<f64>,

    /// Log every forwarded request.
    #[arg(long, env = "PIVOT_ACCESS_LOG")]
    access_log: bool,

    /// Also log request/response payloads (debug level).
    #[arg(long, env = "PIVOT_ACCESS_LOG_PAYLOADS")]
    access_log_payloads: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind_addr: self.bind_addr.clone(),
            backends: self.backends.clone(),
            weights: self.weights.clone(),
            health_check_path: self.health_path.clone(),
            info_path: self.info_path.clone(),
            health_check_interval_secs: self.health_interval_secs,
            backend_request_timeout_ms: self.backend_timeout_ms,
            algorithm: self.lb_algorithm.clone(),
            ewma_alpha: self.ewma_alpha,
            access_log: self.access_log.then_some(true),
            access_log_payloads: self.access_log_payloads.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BalancerError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut raw = RawConfig::load(&cli.config)?;
    raw.apply_overrides(cli.overrides());
    let config = Arc::new(raw.finalize()?);

    let client = Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_millis(500))
        .timeout(config.backend_request_timeout)
        .build()
        .expect("failed to create HTTP client");

    let strategy = strategy::for_algorithm(config.algorithm, config.ewma_alpha);
    let mut pool = BackendPool::new(strategy);
    for entry in &config.backends {
        let forwarder = Forwarder::new(client.clone(), entry.url.clone());
        pool.add_backend(Backend::new(entry.url.clone(), forwarder, entry.weight));
        info!(url = %entry.url, weight = entry.weight, "configured backend");
    }
    let pool = Arc::new(pool);
    TOTAL_BACKENDS.set(pool.len() as i64);

    info!("performing initial health check");
    health::perform_health_check_cycle(&pool, &client, &config).await;
    info!("initial health check complete");

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.spawn(health::health_check_loop(
        Arc::clone(&pool),
        client.clone(),
        Arc::clone(&config),
        coordinator.subscribe(),
    ));

    let state = Arc::new(AppState { pool, config: Arc::clone(&config), client });
    let app = router(state);

    let addr = config.bind_addr.parse()?;
    let server = axum::Server::bind(&addr).serve(app.into_make_service());

    let force_shutdown_flag = Arc::new(AtomicBool::new(false));
    let force_flag = Arc::clone(&force_shutdown_flag);
    let graceful = server.with_graceful_shutdown(async move {
        let force = shutdown_signal().await;
        if force {
            force_flag.store(true, Ordering::Relaxed);
        }
        info!(forced = force, "received shutdown signal, stopping server");
    });

    info!(
        bind_addr = %config.bind_addr,
        algorithm = config.algorithm.as_str(),
        backends = config.backends.len(),
        "starting pivot-balancer"
    );

    if let Err(e) = graceful.await {
        error!(error = %e, "server error");
    }

    if force_shutdown_flag.load(Ordering::Relaxed) {
        info!("forcing shutdown of background tasks");
        coordinator.abort_all();
    } else if let Err(e) = coordinator.shutdown(Duration::from_secs(30)).await {
        error!(error = %e, "graceful shutdown failed");
    }

    info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal. Returns `true` when a second `Ctrl+C` asks
/// for a forced shutdown.
async fn shutdown_signal() -> bool {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, starting graceful shutdown; press again within 10s to force");
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("second Ctrl+C received, forcing immediate shutdown");
                    true
                }
                _ = tokio::time::sleep(Duration::from_secs(10)) => false,
            }
        }
        _ = terminate => {
            info!("SIGTERM received, starting graceful shutdown");
            false
        }
    }
}
