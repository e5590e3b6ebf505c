//! Shared application state for Axum handlers and the security pipeline.
//!
//! This module wires the security components together:
//!
//! - **AuditLogger**: process-wide audit trail and alert dispatch
//! - **RateLimiter**: fixed-window counters over the configured store
//! - **CsrfProtection**: session-bound token issuance and verification
//! - **Identity**: the session table consulted for rate-limit keys and token binding
//!
//! # Structured Concurrency
//!
//! Expired counters, tokens and anomaly windows are evicted by a background
//! task managed with `tokio_util::task::TaskTracker` and `CancellationToken`.
//! Call `shutdown()` to stop it before application exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::audit::AuditLogger;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::csrf::CsrfProtection;
use crate::error::{AppError, AppResult};
use crate::identity::SessionCookieIdentity;
use crate::middleware::{SecurityLayer, SecurityPipeline};
use crate::rate_limit::{MemoryRateLimitStore, RateLimitStore, RateLimiter};
use crate::sanitize::QuerySanitizer;

/// Shared application state.
///
/// Cloned for each request handler. All internal data is reference counted.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::in_memory(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Stop the sweep task and drain alert dispatches
/// ```
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub audit: AuditLogger,
    pub rate_limiter: RateLimiter,
    pub csrf: CsrfProtection,
    pub identity: Arc<SessionCookieIdentity>,
    pub query: QuerySanitizer,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state over an explicit clock and counter store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the query patterns fail to compile.
    pub fn new(
        config: Config,
        clock: SharedClock,
        rate_limit_store: Arc<dyn RateLimitStore>,
    ) -> AppResult<Self> {
        let audit = AuditLogger::new(config.audit_settings(), clock.clone());
        let rate_limiter = RateLimiter::new(rate_limit_store, clock.clone(), config.store_timeout);
        let csrf = CsrfProtection::in_memory(audit.clone(), clock.clone(), config.csrf_settings());
        let query = QuerySanitizer::new()
            .map_err(|e| AppError::Internal(format!("Invalid query sanitizer pattern: {e}")))?;

        let state = Self {
            config: Arc::new(config),
            clock,
            audit,
            rate_limiter,
            csrf,
            identity: Arc::new(SessionCookieIdentity::default()),
            query,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweep_task();

        Ok(state)
    }

    /// State with the system clock and in-process counters.
    pub fn in_memory(config: Config) -> AppResult<Self> {
        Self::new(config, SystemClock::shared(), Arc::new(MemoryRateLimitStore::new()))
    }

    /// The pipeline layer over this state's components.
    pub fn security_layer(&self) -> SecurityLayer {
        SecurityLayer::new(SecurityPipeline {
            routes: self.config.route_classifier(),
            trusted_proxies: self.config.trusted_proxy_config(),
            identity: self.identity.clone(),
            rate_limiter: self.rate_limiter.clone(),
            rate_limit_rules: self.config.rate_limit_rules.clone(),
            csrf: self.csrf.clone(),
            query: self.query.clone(),
            audit: self.audit.clone(),
            headers: self.config.security_headers(),
            max_body_size: self.config.max_request_body_size,
            store_timeout: self.config.store_timeout,
        })
    }

    /// Spawn the periodic eviction of expired counters, tokens and anomaly windows.
    ///
    /// Correctness never depends on this task: expiry is checked on every access.
    fn spawn_sweep_task(&self) {
        let rate_limiter = self.rate_limiter.clone();
        let csrf = self.csrf.clone();
        let audit = self.audit.clone();
        let period = self.config.rate_limit_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let counters = rate_limiter.sweep().await;
                        let tokens = csrf.sweep().await;
                        let anomalies = audit.sweep();
                        trace!(counters, tokens, anomalies, "Expired entries evicted");
                    }
                }
            }

            debug!("Sweep task shutting down");
        });
    }

    /// Gracefully shutdown background work.
    ///
    /// 1. Signals the sweep task to stop
    /// 2. Waits for it to complete
    /// 3. Waits for in-flight alert dispatches
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.audit.shutdown().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Counter store selected by configuration.
///
/// With the `redis-store` feature and `REDIS_URL` set, counters live in
/// Redis; otherwise they are kept in process.
///
/// # Errors
///
/// Returns `AppError::Internal` if Redis cannot be reached at startup.
pub async fn rate_limit_store(config: &Config) -> AppResult<Arc<dyn RateLimitStore>> {
    #[cfg(feature = "redis-store")]
    if let Some(url) = &config.redis_url {
        let store = crate::rate_limit::redis::RedisRateLimitStore::connect(url)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to connect to Redis: {e}")))?;
        info!("Rate limit counters stored in Redis");
        return Ok(Arc::new(store));
    }

    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the redis-store feature is disabled, using memory");
    }
    Ok(Arc::new(MemoryRateLimitStore::new()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_state_wiring_and_shutdown() {
        let clock: SharedClock = ManualClock::new(0);
        let state = AppState::new(
            Config::default(),
            clock,
            Arc::new(MemoryRateLimitStore::new()),
        )
        .unwrap();

        assert_eq!(state.rate_limiter.store_name(), "memory");
        let layer = state.security_layer();
        assert_eq!(layer.pipeline().max_body_size, 1024 * 1024);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_store_without_redis_url() {
        let store = rate_limit_store(&Config::default()).await.unwrap();
        assert_eq!(store.name(), "memory");
    }
}
