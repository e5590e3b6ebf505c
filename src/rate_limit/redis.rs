//! Redis-backed counters shared between instances.
//!
//! Each identifier is a Redis key incremented by a Lua script that sets the
//! key's expiry on the first hit of a window, so the increment and the window
//! start are atomic on the server. Expired windows disappear on their own.

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::store::{RateLimitEntry, RateLimitStore};
use crate::error::SecurityError;

const KEY_PREFIX: &str = "rate_limit:";

const HIT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisRateLimitStore {
    /// Connect to `redis_url`. The connection manager reconnects on failure.
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: Script::new(HIT_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        identifier: &str,
        limit: u32,
        window_ms: u64,
        now: u64,
    ) -> Result<RateLimitEntry, SecurityError> {
        let mut conn = self.conn.clone();
        let (count, ttl): (i64, i64) = self
            .script
            .key(format!("{KEY_PREFIX}{identifier}"))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "Redis rate limit script failed");
                SecurityError::Store {
                    store: "rate_limit",
                    message: e.to_string(),
                }
            })?;

        let remaining_ms = u64::try_from(ttl).unwrap_or(0).min(window_ms);
        Ok(RateLimitEntry {
            identifier: identifier.to_string(),
            window_start: now.saturating_sub(window_ms - remaining_ms),
            count: u32::try_from(count).unwrap_or(u32::MAX),
            limit,
            window_ms,
        })
    }

    async fn sweep(&self, _now: u64) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
