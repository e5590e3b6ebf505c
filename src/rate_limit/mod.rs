//! Fixed-window rate limiting.
//!
//! # Algorithm
//!
//! Each identifier owns a counter and the time its window opened. The first
//! request of a window sets `count = 1`; later requests increment. With a
//! limit of `N`, requests `1..=N` are allowed with `remaining` going
//! `N-1 .. 0`, and request `N+1` is the first rejection. A window is closed
//! once strictly more than its length has elapsed, and that is checked on
//! every access, so the periodic [`RateLimiter::sweep`] only bounds memory.
//!
//! # Identifiers
//!
//! The middleware keys verified users as `user:<id>` and everyone else as
//! `ip:<client-ip>`, then appends the matched rule prefix, so routes with
//! different quotas never share a counter.
//!
//! # Store failures
//!
//! Every store call is bounded by a timeout. The limiter reports the failure
//! and the middleware fails open: a counter outage must not deny service.

mod store;

#[cfg(feature = "redis-store")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::SecurityError;
use crate::utils::path_matches_prefix;

pub use store::{MemoryRateLimitStore, RateLimitEntry, RateLimitStore};

/// Name reported for the rule used when no prefix matches.
pub const DEFAULT_RULE: &str = "default";

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub max: u32,
    pub window: Duration,
}

impl Quota {
    pub const fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }

    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// A zero maximum turns limiting off for the route.
    pub fn is_disabled(&self) -> bool {
        self.max == 0
    }
}

/// A quota applied to every path under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub prefix: String,
    pub quota: Quota,
}

/// Per-route quotas with a default. The longest matching prefix wins.
#[derive(Debug, Clone)]
pub struct RateLimitRules {
    default: Quota,
    rules: Vec<RateLimitRule>,
}

impl RateLimitRules {
    pub fn new(default: Quota) -> Self {
        Self {
            default,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, prefix: impl Into<String>, quota: Quota) -> Self {
        let prefix = prefix.into();
        self.rules.retain(|r| r.prefix != prefix);
        self.rules.push(RateLimitRule { prefix, quota });
        self.rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        self
    }

    /// Parse `prefix=max/window_ms` entries separated by commas.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use request_guard::rate_limit::{Quota, RateLimitRules};
    ///
    /// let rules = RateLimitRules::parse(
    ///     Quota::new(100, Duration::from_secs(60)),
    ///     "/api/auth=5/60000, /api/posts=30/60000",
    /// ).unwrap();
    /// assert_eq!(rules.resolve("/api/auth/login").1.max, 5);
    /// assert_eq!(rules.resolve("/about").1.max, 100);
    /// ```
    pub fn parse(default: Quota, spec: &str) -> Result<Self, String> {
        let mut rules = Self::new(default);
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (prefix, quota) = item
                .split_once('=')
                .ok_or_else(|| format!("rate limit rule '{item}' is missing '='"))?;
            let (max, window_ms) = quota
                .split_once('/')
                .ok_or_else(|| format!("rate limit rule '{item}' must be prefix=max/window_ms"))?;
            let max: u32 = max
                .trim()
                .parse()
                .map_err(|_| format!("rate limit rule '{item}' has an invalid max"))?;
            let window_ms: u64 = window_ms
                .trim()
                .parse()
                .map_err(|_| format!("rate limit rule '{item}' has an invalid window"))?;
            if window_ms == 0 {
                return Err(format!("rate limit rule '{item}' has a zero window"));
            }
            let prefix = prefix.trim();
            if !prefix.starts_with('/') {
                return Err(format!("rate limit rule '{item}' prefix must start with '/'"));
            }
            rules = rules.with_rule(prefix, Quota::new(max, Duration::from_millis(window_ms)));
        }
        Ok(rules)
    }

    pub fn default_quota(&self) -> Quota {
        self.default
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    /// Rule name and quota for `path`.
    pub fn resolve(&self, path: &str) -> (&str, Quota) {
        self.rules
            .iter()
            .find(|r| path_matches_prefix(path, &r.prefix))
            .map_or((DEFAULT_RULE, self.default), |r| (r.prefix.as_str(), r.quota))
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window reopens; set only when rejected.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: u32::MAX,
            retry_after_secs: None,
        }
    }

    /// Convert a rejection into the pipeline error.
    pub fn into_error(self) -> Option<SecurityError> {
        (!self.allowed).then(|| SecurityError::RateLimitExceeded {
            retry_after_secs: self.retry_after_secs.unwrap_or(1),
            limit: self.limit,
        })
    }
}

/// Fixed-window limiter over a pluggable counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: SharedClock,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: SharedClock, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Limiter over a fresh in-process store.
    pub fn in_memory(clock: SharedClock, timeout: Duration) -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()), clock, timeout)
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Count one request for `identifier` against `quota`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::UpstreamStoreTimeout`] when the store does not answer
    /// in time, or the store's own error.
    pub async fn check(
        &self,
        identifier: &str,
        quota: Quota,
    ) -> Result<RateLimitDecision, SecurityError> {
        if quota.is_disabled() {
            return Ok(RateLimitDecision::unlimited());
        }

        let now = self.clock.now_millis();
        let entry = tokio::time::timeout(
            self.timeout,
            self.store.hit(identifier, quota.max, quota.window_ms(), now),
        )
        .await
        .map_err(|_| {
            warn!(identifier, store = self.store.name(), "Rate limit store timed out");
            SecurityError::UpstreamStoreTimeout { store: "rate_limit" }
        })??;

        if entry.count <= quota.max {
            return Ok(RateLimitDecision {
                allowed: true,
                limit: quota.max,
                remaining: quota.max - entry.count,
                retry_after_secs: None,
            });
        }

        let wait_ms = entry.resets_at().saturating_sub(now);
        let retry_after = wait_ms.div_ceil(1000).max(1);
        debug!(
            identifier,
            count = entry.count,
            limit = quota.max,
            retry_after_secs = retry_after,
            "Rate limit exceeded"
        );
        Ok(RateLimitDecision {
            allowed: false,
            limit: quota.max,
            remaining: 0,
            retry_after_secs: Some(retry_after),
        })
    }

    /// Evict expired counters.
    pub async fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_millis()).await
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
