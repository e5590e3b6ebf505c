//! Identity supplied by the surrounding application's session layer.
//!
//! Session issuance lives outside this crate. The pipeline only asks an
//! [`IdentityProvider`] who is making the request, and uses the answer to
//! pick the rate-limit identifier and to bind CSRF tokens.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Serialize;

/// Default name of the application's session cookie.
pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Option<String>,
    pub email_verified: bool,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>, email_verified: bool) -> Self {
        Self {
            user_id: Some(user_id.into()),
            email_verified,
        }
    }

    /// The user id, but only once the e-mail address has been verified.
    pub fn verified_user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|_| self.email_verified)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, headers: &HeaderMap, cookies: &HashMap<String, String>) -> Identity;
}

/// Provider for deployments without sessions: everyone is anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentity;

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn identify(&self, _headers: &HeaderMap, _cookies: &HashMap<String, String>) -> Identity {
        Identity::anonymous()
    }
}

/// In-process session table keyed by the value of a session cookie.
///
/// The session layer calls [`login`](Self::login) and [`logout`](Self::logout);
/// unknown or missing cookies resolve to an anonymous identity.
#[derive(Debug)]
pub struct SessionCookieIdentity {
    cookie_name: String,
    sessions: DashMap<String, Identity>,
}

impl Default for SessionCookieIdentity {
    fn default() -> Self {
        Self::new(SESSION_COOKIE)
    }
}

impl SessionCookieIdentity {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn login(&self, session: impl Into<String>, identity: Identity) {
        self.sessions.insert(session.into(), identity);
    }

    pub fn logout(&self, session: &str) -> bool {
        self.sessions.remove(session).is_some()
    }
}

#[async_trait]
impl IdentityProvider for SessionCookieIdentity {
    async fn identify(&self, _headers: &HeaderMap, cookies: &HashMap<String, String>) -> Identity {
        cookies
            .get(&self.cookie_name)
            .and_then(|session| self.sessions.get(session).map(|i| i.value().clone()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cookies(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_verified_user_id() {
        assert_eq!(Identity::user("u1", true).verified_user_id(), Some("u1"));
        assert_eq!(Identity::user("u1", false).verified_user_id(), None);
        assert_eq!(Identity::anonymous().verified_user_id(), None);
    }

    #[tokio::test]
    async fn test_session_cookie_lookup() {
        let provider = SessionCookieIdentity::default();
        provider.login("s-1", Identity::user("u1", true));
        let headers = HeaderMap::new();

        let known = provider.identify(&headers, &cookies(&[("session", "s-1")])).await;
        assert_eq!(known.user_id.as_deref(), Some("u1"));

        let unknown = provider.identify(&headers, &cookies(&[("session", "nope")])).await;
        assert_eq!(unknown, Identity::anonymous());

        assert!(provider.logout("s-1"));
        let gone = provider.identify(&headers, &cookies(&[("session", "s-1")])).await;
        assert_eq!(gone, Identity::anonymous());
    }
}
