//! Counter storage for the fixed-window limiter.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::SecurityError;

/// Counter state for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub identifier: String,
    /// Epoch milliseconds at which the current window opened.
    pub window_start: u64,
    pub count: u32,
    pub limit: u32,
    pub window_ms: u64,
}

impl RateLimitEntry {
    fn open(identifier: &str, limit: u32, window_ms: u64, now: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            window_start: now,
            count: 1,
            limit,
            window_ms,
        }
    }

    /// A window is closed once strictly more than `window_ms` has elapsed.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) > self.window_ms
    }

    /// Epoch milliseconds at which this window closes.
    pub fn resets_at(&self) -> u64 {
        self.window_start.saturating_add(self.window_ms)
    }
}

/// Backend holding per-identifier counters.
///
/// `hit` must be atomic per identifier: concurrent hits for the same key are
/// all counted and observe distinct counts.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record one request and return the entry after the increment.
    async fn hit(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
        now: u64,
    ) -> Result<RateLimitEntry, SecurityError>;

    /// Evict expired entries, returning how many were removed.
    async fn sweep(&self, now: u64) -> usize;

    /// Short name used in logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// In-process store backed by a sharded concurrent map.
///
/// Counters are local to this process; a multi-instance deployment needs a
/// shared backend.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
        now: u64,
    ) -> Result<RateLimitEntry, SecurityError> {
        // The entry guard holds the shard lock for the read-modify-write
        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                ..RateLimitEntry::open(identifier, limit, window_ms, now)
            });

        if entry.is_expired(now) {
            *entry = RateLimitEntry::open(identifier, limit, window_ms, now);
        } else {
            entry.count = entry.count.saturating_add(1);
            entry.limit = limit;
            entry.window_ms = window_ms;
        }

        Ok(entry.clone())
    }

    async fn sweep(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
