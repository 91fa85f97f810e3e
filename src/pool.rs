//! Connection pool for instance HTTP connections
//!
//! One pooled hyper client is shared by all routes and speaks both `http`
//! and `https` (rustls, webpki roots). On top of it every target authority
//! gets a semaphore, so a misbehaving instance can hold at most
//! `max_connections_per_target` requests and never starves the others.
//! Limiters with nothing in flight are dropped whenever a new authority
//! shows up, so moved or removed instances do not accumulate.

use crate::ProxyBody;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The per-target limiter was closed
    #[error("connection limit for {0} closed")]
    LimitClosed(String),
    /// TLS client setup failed
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent through the pool
    total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    failed_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Concurrent requests per target authority
    pub max_connections_per_target: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            max_connections_per_target: 20,
        }
    }
}

impl From<&crate::config::ProxyConfig> for PoolConfig {
    fn from(config: &crate::config::ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
            max_connections_per_target: config.max_connections_per_target,
        }
    }
}

/// A connection pool for HTTP connections to instances
pub struct ConnectionPool {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    limits: DashMap<String, Arc<Semaphore>>,
    stats: PoolStats,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            max_per_target = config.max_connections_per_target,
            "Connection pool initialized"
        );

        Ok(Self {
            client,
            limits: DashMap::new(),
            stats: PoolStats::default(),
            config,
        })
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    fn limiter(&self, authority: &str) -> Arc<Semaphore> {
        if let Some(limit) = self.limits.get(authority) {
            return Arc::clone(&limit);
        }
        self.prune_idle();
        self.limits
            .entry(authority.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections_per_target.max(1))))
            .clone()
    }

    /// Drop limiters that nobody holds a permit of or waits on.
    /// Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.limits.len();
        // Permits and pending acquires each hold a clone of the semaphore.
        self.limits.retain(|_, limit| Arc::strong_count(limit) > 1);
        let removed = before.saturating_sub(self.limits.len());
        if removed > 0 {
            debug!(removed, remaining = self.limits.len(), "Pruned idle target limiters");
        }
        removed
    }

    /// Number of target authorities with a limiter
    pub fn tracked_targets(&self) -> usize {
        self.limits.len()
    }

    /// Wait for a request slot towards `authority`
    pub async fn acquire(&self, authority: &str) -> Result<OwnedSemaphorePermit, PoolError> {
        self.limiter(authority)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::LimitClosed(authority.to_string()))
    }

    /// Free request slots towards `authority`
    pub fn available_permits(&self, authority: &str) -> usize {
        self.limits
            .get(authority)
            .map(|s| s.available_permits())
            .unwrap_or(self.config.max_connections_per_target)
    }

    /// Send a fully built request through the pooled client
    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, PoolError> {
        self.stats.record_request();
        self.client.request(req).await.map_err(|e| {
            self.stats.record_failure();
            PoolError::from(e)
        })
    }
}
