//! Server-side storage of issued CSRF tokens, keyed by session id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::SecurityError;

/// The session a token was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    /// Opaque id carried by the `csrf-session` cookie.
    pub session_id: String,
    /// Authenticated user at issuance; `None` for anonymous sessions.
    pub user_id: Option<String>,
}

/// An issued token. Valid only for its binding and only while `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    /// 64 lowercase hex characters.
    pub value: String,
    pub session_binding: SessionBinding,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait CsrfTokenStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<CsrfToken>, SecurityError>;

    /// Store `token` under its binding's session id, replacing any previous one.
    async fn put(&self, token: CsrfToken) -> Result<(), SecurityError>;

    /// Returns whether a token was removed.
    async fn remove(&self, session_id: &str) -> Result<bool, SecurityError>;

    /// Drop tokens expired at `now`.
    async fn sweep(&self, now: DateTime<Utc>) -> usize;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct MemoryCsrfTokenStore {
    tokens: DashMap<String, CsrfToken>,
}

impl MemoryCsrfTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CsrfTokenStore for MemoryCsrfTokenStore {
    async fn get(&self, session_id: &str) -> Result<Option<CsrfToken>, SecurityError> {
        Ok(self.tokens.get(session_id).map(|t| t.value().clone()))
    }

    async fn put(&self, token: CsrfToken) -> Result<(), SecurityError> {
        self.tokens
            .insert(token.session_binding.session_id.clone(), token);
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<bool, SecurityError> {
        Ok(self.tokens.remove(session_id).is_some())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| !token.is_expired(now));
        before.saturating_sub(self.tokens.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(session: &str, issued: DateTime<Utc>, ttl_secs: i64) -> CsrfToken {
        CsrfToken {
            value: "ab".repeat(32),
            session_binding: SessionBinding {
                session_id: session.to_string(),
                user_id: None,
            },
            issued_at: issued,
            expires_at: issued + Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryCsrfTokenStore::new();
        let now = Utc::now();
        store.put(token("s1", now, 60)).await.unwrap();

        assert_eq!(store.get("s1").await.unwrap().unwrap().value.len(), 64);
        assert!(store.get("s2").await.unwrap().is_none());
        assert!(store.remove("s1").await.unwrap());
        assert!(!store.remove("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_drops_expired() {
        let store = MemoryCsrfTokenStore::new();
        let now = Utc::now();
        store.put(token("old", now - Duration::seconds(120), 60)).await.unwrap();
        store.put(token("new", now, 60)).await.unwrap();

        assert_eq!(store.sweep(now).await, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("new").await.unwrap().is_some());
    }

    #[test]
    fn test_expiry_is_exclusive() {
        let now = Utc::now();
        let t = token("s", now, 10);
        assert!(!t.is_expired(now + Duration::seconds(9)));
        assert!(t.is_expired(now + Duration::seconds(10)));
    }
}
