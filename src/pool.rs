//! The backend pool: owns the backend set, serialises selection, and lets
//! request handlers wait for the first healthy backend.
//!
//! Selection and liveness publication are mutually excluded by a short-lived
//! lock that is never held across an await point. Waiters park on a
//! [`Notify`] that is broadcast whenever any backend transitions from dead to
//! alive, so a recovering pool unblocks pending requests immediately instead
//! of on the next poll.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use url::Url;

use crate::backend::Backend;
use crate::strategy::Strategy;

pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    strategy: Box<dyn Strategy>,
    /// Serialises `strategy.select` and liveness updates. Strategies run
    /// their whole scan under this lock and must not block.
    select_lock: Mutex<()>,
    backend_available: Notify,
}

impl BackendPool {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        Self {
            backends: Vec::new(),
            strategy,
            select_lock: Mutex::new(()),
            backend_available: Notify::new(),
        }
    }

    /// Appends a backend. Construction-phase only: the list is immutable once
    /// the pool starts serving, which is what lets `select` run lock-light.
    pub fn add_backend(&mut self, backend: Backend) {
        self.backends.push(Arc::new(backend));
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn try_select(&self) -> Option<Arc<Backend>> {
        let _guard = self.select_lock.lock();
        self.strategy.select(&self.backends)
    }

    /// Selects the next backend, waiting up to `wait` for one to become
    /// healthy. Returns `None` once the deadline passes; dropping the future
    /// (client disconnect) is the other cancellation path and needs no
    /// cleanup since no lock is held while parked.
    pub async fn get_next(&self, wait: Duration) -> Option<Arc<Backend>> {
        tokio::time::timeout(wait, self.acquire()).await.ok()
    }

    async fn acquire(&self) -> Arc<Backend> {
        loop {
            let notified = self.backend_available.notified();
            tokio::pin!(notified);
            // Register before checking so a broadcast that lands between the
            // failed select and the await below still wakes us.
            notified.as_mut().enable();
            if let Some(backend) = self.try_select() {
                return backend;
            }
            notified.await;
        }
    }

    /// Publishes a liveness observation for the backend with the given URL.
    ///
    /// A dead-to-alive transition broadcasts to every parked waiter; staying
    /// in the same state, or any transition to dead, wakes nobody. Unknown
    /// URLs are ignored.
    pub fn mark_backend_status(&self, url: &Url, alive: bool) {
        let _guard = self.select_lock.lock();
        if let Some(backend) = self.backends.iter().find(|b| b.url().as_str() == url.as_str()) {
            let was_alive = backend.is_alive();
            backend.set_alive(alive);
            if alive && !was_alive {
                self.backend_available.notify_waiters();
            }
        }
    }

    /// Feeds a probe round-trip into the strategy's latency model.
    pub fn update_response_time(&self, backend: &Backend, duration: Duration) {
        self.strategy.update_response_time(backend, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::Forwarder;
    use crate::strategy::RoundRobin;

    fn backend(url: &str) -> (Backend, Url) {
        let url = Url::parse(url).unwrap();
        let b = Backend::new(url.clone(), Forwarder::new(reqwest::Client::new(), url.clone()), 1);
        (b, url)
    }

    fn pool_with(urls: &[&str]) -> (BackendPool, Vec<Url>) {
        let mut pool = BackendPool::new(Box::new(RoundRobin::new()));
        let mut parsed = Vec::new();
        for u in urls {
            let (b, url) = backend(u);
            pool.add_backend(b);
            parsed.push(url);
        }
        (pool, parsed)
    }

    #[test]
    fn add_backend_preserves_insertion_order() {
        let (pool, urls) = pool_with(&["http://127.0.0.1:9091", "http://127.0.0.1:9092"]);
        assert_eq!(pool.len(), 2);
        let listed: Vec<_> = pool.backends().iter().map(|b| b.url().clone()).collect();
        assert_eq!(listed, urls);
    }

    #[tokio::test]
    async fn get_next_returns_an_alive_backend() {
        let (pool, _) = pool_with(&["http://127.0.0.1:9091"]);
        pool.backends()[0].set_alive(true);
        let got = pool.get_next(Duration::from_millis(100)).await;
        assert_eq!(got.unwrap().url().as_str(), "http://127.0.0.1:9091/");
    }

    #[tokio::test(start_paused = true)]
    async fn get_next_on_empty_pool_honours_deadline() {
        let pool = BackendPool::new(Box::new(RoundRobin::new()));
        let started = tokio::time::Instant::now();
        let got = pool.get_next(Duration::from_millis(100)).await;
        let waited = started.elapsed();
        assert!(got.is_none());
        assert!(waited >= Duration::from_millis(100), "returned early after {waited:?}");
        assert!(waited < Duration::from_millis(150), "overshot deadline by {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn get_next_on_all_dead_pool_times_out() {
        let (pool, _) = pool_with(&["http://127.0.0.1:9091"]);
        let got = pool.get_next(Duration::from_millis(100)).await;
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_by_recovery() {
        let (pool, urls) = pool_with(&["http://127.0.0.1:9091"]);
        let pool = Arc::new(pool);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                let got = pool.get_next(Duration::from_secs(5)).await;
                (got, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.mark_backend_status(&urls[0], true);

        let (got, waited) = waiter.await.unwrap();
        assert_eq!(got.unwrap().url().as_str(), "http://127.0.0.1:9091/");
        assert!(waited < Duration::from_millis(200), "woke only after {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn every_concurrent_waiter_is_released() {
        let (pool, urls) = pool_with(&["http://127.0.0.1:9091"]);
        let pool = Arc::new(pool);

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.get_next(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.mark_backend_status(&urls[0], true);

        for waiter in waiters {
            assert!(waiter.await.unwrap().is_some());
        }
    }

    #[test]
    fn mark_backend_status_round_trips_and_is_idempotent() {
        let (pool, urls) = pool_with(&["http://127.0.0.1:9091"]);
        pool.mark_backend_status(&urls[0], true);
        assert!(pool.backends()[0].is_alive());
        pool.mark_backend_status(&urls[0], true);
        assert!(pool.backends()[0].is_alive());
        pool.mark_backend_status(&urls[0], false);
        assert!(!pool.backends()[0].is_alive());
        pool.mark_backend_status(&urls[0], false);
        assert!(!pool.backends()[0].is_alive());
    }

    #[test]
    fn mark_backend_status_ignores_unknown_url() {
        let (pool, _) = pool_with(&["http://127.0.0.1:9091"]);
        let stranger = Url::parse("http://127.0.0.1:9999").unwrap();
        pool.mark_backend_status(&stranger, true);
        assert!(!pool.backends()[0].is_alive());
    }

    #[test]
    fn matches_on_normalised_url_string() {
        let (pool, _) = pool_with(&["http://127.0.0.1:9091"]);
        // Same identity through a differently written but equivalent URL.
        let respelled = Url::parse("http://127.0.0.1:9091/").unwrap();
        pool.mark_backend_status(&respelled, true);
        assert!(pool.backends()[0].is_alive());
    }
}
