//! Coordinated teardown of background tasks.
//!
//! Tasks spawned through the coordinator subscribe to a watch channel; on
//! shutdown the channel closes, every subscriber drains, and the coordinator
//! joins them under a timeout so a stuck task cannot hang process exit.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("a background task panicked during shutdown")]
    Panic(#[from] JoinError),
    #[error("graceful shutdown timed out after {0:?}")]
    Timeout(Duration),
}

pub struct ShutdownCoordinator {
    tasks: JoinSet<()>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(());
        Self { tasks: JoinSet::new(), shutdown_tx }
    }

    /// Spawns a task whose lifetime the coordinator owns. Dropping the
    /// coordinator aborts everything it spawned.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// A receiver that resolves when shutdown begins. Each task should hold
    /// its own subscription.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Hard stop, no draining.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }

    /// Signals shutdown and waits up to `timeout` for every task to drain.
    /// Panics inside tasks are surfaced rather than swallowed.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ShutdownError> {
        let ShutdownCoordinator { mut tasks, shutdown_tx } = self;

        info!(tasks = tasks.len(), "signalling background tasks to stop");
        drop(shutdown_tx);

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                joined?;
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(Ok(())) => {
                info!("all background tasks stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "background task panicked during shutdown");
                Err(ShutdownError::Panic(e))
            }
            Err(_) => {
                error!(?timeout, "shutdown timed out, aborting remaining tasks");
                tasks.abort_all();
                Err(ShutdownError::Timeout(timeout))
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
