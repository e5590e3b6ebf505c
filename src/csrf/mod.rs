//! Session-bound double-submit CSRF protection.
//!
//! # Transport
//!
//! - `csrf-session` cookie (HttpOnly, SameSite=Strict): opaque session id the
//!   token is bound to on the server.
//! - `csrf-token` cookie (readable, SameSite=Strict): the token itself, for
//!   scripts that echo it back.
//! - The echoed value arrives in the `x-csrf-token` header or, for JSON and
//!   urlencoded bodies, in one of the fields `_csrf`, `csrfToken`, `csrf_token`.
//!
//! # Verification
//!
//! Safe methods and exempt path prefixes always pass. For everything else the
//! echoed value must equal the token cookie and the token stored for the
//! session, both compared in constant time; the stored token must be unexpired
//! and issued to the identity making the request. Store lookups are bounded
//! and a timeout fails closed. Every failure is written to the audit log as
//! `CSRF_VIOLATION` before the caller turns it into a 403.
//!
//! Tokens persist for the session. They are regenerated only when missing or
//! expired, and by [`CsrfProtection::rotate`] on login or logout.

pub mod cookie;
mod store;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use url::form_urlencoded;

pub use cookie::{CookieConfig, SameSite};
pub use store::{CsrfToken, CsrfTokenStore, MemoryCsrfTokenStore, SessionBinding};

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::clock::SharedClock;
use crate::error::SecurityError;
use crate::metrics;
use crate::middleware::context::SecurityRequestContext;
use crate::utils::path_matches_prefix;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const SESSION_COOKIE: &str = "csrf-session";
pub const TOKEN_COOKIE: &str = "csrf-token";

/// Body fields checked when the header is absent, in order.
pub const BODY_FIELDS: &[&str] = &["_csrf", "csrfToken", "csrf_token"];

const TOKEN_BYTES: usize = 32;

/// Why an unsafe request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfFailure {
    MissingSessionCookie,
    MissingTokenCookie,
    MissingSubmittedToken,
    /// Echoed value differs from the token cookie.
    TokenMismatch,
    UnknownSession,
    Expired,
    /// Token is valid but was issued to a different session.
    SessionMismatch,
    /// The user logged in or out since the token was issued.
    IdentityChanged,
    StoreUnavailable,
}

impl CsrfFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            CsrfFailure::MissingSessionCookie => "missing_session_cookie",
            CsrfFailure::MissingTokenCookie => "missing_token_cookie",
            CsrfFailure::MissingSubmittedToken => "missing_submitted_token",
            CsrfFailure::TokenMismatch => "token_mismatch",
            CsrfFailure::UnknownSession => "unknown_session",
            CsrfFailure::Expired => "expired",
            CsrfFailure::SessionMismatch => "session_mismatch",
            CsrfFailure::IdentityChanged => "identity_changed",
            CsrfFailure::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for CsrfFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CsrfSettings {
    pub token_ttl: Duration,
    /// Path prefixes whose unsafe requests skip verification.
    pub exempt_paths: Vec<String>,
    /// Mark cookies `Secure` (production).
    pub secure_cookies: bool,
    /// Bound on every token store call.
    pub store_timeout: Duration,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(24 * 60 * 60),
            exempt_paths: ["/api/auth", "/api/health", "/api/register", "/api/verify-email"]
                .into_iter()
                .map(String::from)
                .collect(),
            secure_cookies: false,
            store_timeout: Duration::from_millis(250),
        }
    }
}

/// Token handed out by [`CsrfProtection::issue`].
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: CsrfToken,
    /// `true` when the session's existing token was returned.
    pub reused: bool,
}

/// 32 bytes from the OS-seeded CSPRNG, lowercase hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Echoed token from a JSON object or urlencoded form body.
pub fn token_from_body(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    let content_type = content_type?.to_ascii_lowercase();
    if content_type.starts_with("application/json") {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        let object = value.as_object()?;
        BODY_FIELDS
            .iter()
            .find_map(|field| object.get(*field)?.as_str().map(str::to_string))
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let fields: Vec<_> = form_urlencoded::parse(body).collect();
        BODY_FIELDS.iter().find_map(|field| {
            fields
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, value)| value.to_string())
        })
    } else {
        None
    }
}

#[derive(Clone)]
pub struct CsrfProtection {
    store: Arc<dyn CsrfTokenStore>,
    audit: AuditLogger,
    clock: SharedClock,
    settings: Arc<CsrfSettings>,
}

impl CsrfProtection {
    pub fn new(
        store: Arc<dyn CsrfTokenStore>,
        audit: AuditLogger,
        clock: SharedClock,
        settings: CsrfSettings,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            settings: Arc::new(settings),
        }
    }

    pub fn in_memory(audit: AuditLogger, clock: SharedClock, settings: CsrfSettings) -> Self {
        Self::new(Arc::new(MemoryCsrfTokenStore::new()), audit, clock, settings)
    }

    pub fn settings(&self) -> &CsrfSettings {
        &self.settings
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.settings
            .exempt_paths
            .iter()
            .any(|prefix| path_matches_prefix(path, prefix))
    }

    pub fn requires_verification(&self, method: &Method, path: &str) -> bool {
        !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) && !self.is_exempt(path)
    }

    /// Verify a request, auditing any failure.
    ///
    /// `submitted` is the token echoed in the header or body.
    pub async fn verify(
        &self,
        ctx: &SecurityRequestContext,
        submitted: Option<&str>,
    ) -> Result<(), CsrfFailure> {
        if !self.requires_verification(&ctx.method, &ctx.path) {
            return Ok(());
        }

        let Err(reason) = self.check(ctx, submitted).await else {
            return Ok(());
        };

        warn!(
            reason = reason.as_str(),
            path = %ctx.path,
            method = %ctx.method,
            client_ip = %ctx.client_ip,
            "CSRF validation failed"
        );
        metrics::record_csrf_failure(reason.as_str());
        self.audit
            .log(
                AuditEvent::new(AuditEventType::CsrfViolation)
                    .actor(ctx.actor())
                    .with("reason", reason.as_str())
                    .context(ctx.audit_context()),
            )
            .await;
        Err(reason)
    }

    /// Boolean form of [`verify`](Self::verify).
    pub async fn verify_token(
        &self,
        ctx: &SecurityRequestContext,
        submitted: Option<&str>,
    ) -> bool {
        self.verify(ctx, submitted).await.is_ok()
    }

    async fn check(
        &self,
        ctx: &SecurityRequestContext,
        submitted: Option<&str>,
    ) -> Result<(), CsrfFailure> {
        let session_id = ctx
            .cookie(SESSION_COOKIE)
            .ok_or(CsrfFailure::MissingSessionCookie)?;
        let cookie_token = ctx
            .cookie(TOKEN_COOKIE)
            .ok_or(CsrfFailure::MissingTokenCookie)?;
        let submitted = submitted
            .filter(|s| !s.is_empty())
            .ok_or(CsrfFailure::MissingSubmittedToken)?;

        if !constant_time_eq(cookie_token, submitted) {
            return Err(CsrfFailure::TokenMismatch);
        }

        let stored = match self.bounded(self.store.get(session_id)).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(CsrfFailure::UnknownSession),
            Err(_) => return Err(CsrfFailure::StoreUnavailable),
        };

        if stored.is_expired(self.clock.now_utc()) {
            return Err(CsrfFailure::Expired);
        }
        if !constant_time_eq(&stored.value, submitted) {
            return Err(CsrfFailure::SessionMismatch);
        }
        if stored.session_binding.user_id.as_deref() != ctx.identity.user_id.as_deref() {
            return Err(CsrfFailure::IdentityChanged);
        }
        Ok(())
    }

    /// Return the session's token, creating a session and token when the
    /// current one is missing, unknown, expired or bound to another user.
    pub async fn issue(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<IssuedToken, SecurityError> {
        if let Some(session_id) = session_id {
            if let Some(existing) = self.bounded(self.store.get(session_id)).await? {
                if !existing.is_expired(self.clock.now_utc())
                    && existing.session_binding.user_id.as_deref() == user_id
                {
                    return Ok(IssuedToken {
                        token: existing,
                        reused: true,
                    });
                }
                self.bounded(self.store.remove(session_id)).await?;
            }
        }

        let token = self.mint(user_id);
        self.bounded(self.store.put(token.clone())).await?;
        debug!(user_id, "CSRF token issued");
        Ok(IssuedToken {
            token,
            reused: false,
        })
    }

    /// Replace the session with a fresh one. Call on login and logout.
    pub async fn rotate(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<CsrfToken, SecurityError> {
        if let Some(session_id) = session_id {
            self.bounded(self.store.remove(session_id)).await?;
        }
        let token = self.mint(user_id);
        self.bounded(self.store.put(token.clone())).await?;
        debug!(user_id, "CSRF token rotated");
        Ok(token)
    }

    /// Destroy the session's token. Call at session end.
    pub async fn revoke(&self, session_id: &str) -> Result<bool, SecurityError> {
        self.bounded(self.store.remove(session_id)).await
    }

    /// Purge expired tokens.
    pub async fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_utc()).await
    }

    /// Set-Cookie values carrying `token`.
    pub fn set_cookies(&self, token: &CsrfToken) -> [String; 2] {
        let max_age = Some(self.settings.token_ttl.as_secs());
        [
            self.session_cookie(max_age)
                .build_set_cookie(&token.session_binding.session_id),
            self.token_cookie(max_age).build_set_cookie(&token.value),
        ]
    }

    /// Set-Cookie values that remove both cookies.
    pub fn clear_cookies(&self) -> [String; 2] {
        [
            self.session_cookie(None).build_delete_cookie(),
            self.token_cookie(None).build_delete_cookie(),
        ]
    }

    fn session_cookie(&self, max_age_secs: Option<u64>) -> CookieConfig {
        CookieConfig {
            name: SESSION_COOKIE,
            secure: self.settings.secure_cookies,
            http_only: true,
            same_site: SameSite::Strict,
            path: "/",
            max_age_secs,
        }
    }

    fn token_cookie(&self, max_age_secs: Option<u64>) -> CookieConfig {
        CookieConfig {
            http_only: false,
            name: TOKEN_COOKIE,
            ..self.session_cookie(max_age_secs)
        }
    }

    fn mint(&self, user_id: Option<&str>) -> CsrfToken {
        let issued_at = self.clock.now_utc();
        let ttl = chrono::Duration::from_std(self.settings.token_ttl)
            .unwrap_or(chrono::Duration::MAX);
        CsrfToken {
            value: generate_token(),
            session_binding: SessionBinding {
                session_id: generate_token(),
                user_id: user_id.map(str::to_string),
            },
            issued_at,
            expires_at: issued_at
                .checked_add_signed(ttl)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, SecurityError>>,
    ) -> Result<T, SecurityError> {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result.inspect_err(|e| {
                warn!(error = %e, store = self.store.name(), "CSRF token store failed");
                metrics::record_store_degraded("csrf");
            }),
            Err(_) => {
                warn!(store = self.store.name(), "CSRF token store timed out");
                metrics::record_store_degraded("csrf");
                Err(SecurityError::UpstreamStoreTimeout { store: "csrf" })
            }
        }
    }
}
