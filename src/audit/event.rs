//! Audit event vocabulary and the static severity table.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Security-relevant event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    // Authentication
    LoginSuccess,
    LoginFailure,
    Logout,
    PasswordChange,
    PasswordReset,
    EmailVerification,
    SessionExpired,

    // Accounts
    UserRegister,
    UserUpdate,
    UserDelete,
    ProfileUpdate,

    // Content
    PostCreate,
    PostUpdate,
    PostDelete,
    PostView,

    // Attacks and enforcement
    RateLimitExceeded,
    CsrfViolation,
    XssAttempt,
    SqlInjectionAttempt,
    PathTraversalAttempt,
    UnauthorizedAccess,
    SuspiciousActivity,

    // Administration
    AdminAction,
    PermissionChange,
    ConfigChange,

    // System
    SystemError,
    DatabaseError,
    ApiError,
    StoreUnavailable,
}

impl AuditEventType {
    /// Default severity for this event kind.
    pub fn severity(self) -> Severity {
        use AuditEventType::*;
        match self {
            LoginSuccess | Logout | PostView | EmailVerification | SessionExpired => Severity::Low,

            PostCreate | PostUpdate | PostDelete | UserUpdate | ProfileUpdate | PasswordChange
            | UserRegister | ApiError | StoreUnavailable => Severity::Medium,

            LoginFailure | RateLimitExceeded | UnauthorizedAccess | PasswordReset | UserDelete
            | PermissionChange | AdminAction | ConfigChange => Severity::High,

            CsrfViolation | XssAttempt | SqlInjectionAttempt | PathTraversalAttempt
            | SuspiciousActivity | SystemError | DatabaseError => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        use AuditEventType::*;
        match self {
            LoginSuccess => "LOGIN_SUCCESS",
            LoginFailure => "LOGIN_FAILURE",
            Logout => "LOGOUT",
            PasswordChange => "PASSWORD_CHANGE",
            PasswordReset => "PASSWORD_RESET",
            EmailVerification => "EMAIL_VERIFICATION",
            SessionExpired => "SESSION_EXPIRED",
            UserRegister => "USER_REGISTER",
            UserUpdate => "USER_UPDATE",
            UserDelete => "USER_DELETE",
            ProfileUpdate => "PROFILE_UPDATE",
            PostCreate => "POST_CREATE",
            PostUpdate => "POST_UPDATE",
            PostDelete => "POST_DELETE",
            PostView => "POST_VIEW",
            RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            CsrfViolation => "CSRF_VIOLATION",
            XssAttempt => "XSS_ATTEMPT",
            SqlInjectionAttempt => "SQL_INJECTION_ATTEMPT",
            PathTraversalAttempt => "PATH_TRAVERSAL_ATTEMPT",
            UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            AdminAction => "ADMIN_ACTION",
            PermissionChange => "PERMISSION_CHANGE",
            ConfigChange => "CONFIG_CHANGE",
            SystemError => "SYSTEM_ERROR",
            DatabaseError => "DATABASE_ERROR",
            ApiError => "API_ERROR",
            StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity taxonomy, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Whether registered alert callbacks fire for this severity.
    pub fn alerts(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Stable key used for per-actor anomaly counting.
    pub fn key(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.ip.as_deref())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.user_id, &self.ip) {
            (Some(user), Some(ip)) => write!(f, "user:{user}@{ip}"),
            (Some(user), None) => write!(f, "user:{user}"),
            (None, Some(ip)) => write!(f, "ip:{ip}"),
            (None, None) => f.write_str("anonymous"),
        }
    }
}

/// An event submitted to [`AuditLogger::log`](super::AuditLogger::log).
///
/// # Example
///
/// ```rust
/// use request_guard::audit::{AuditEvent, AuditEventType, Severity};
///
/// let event = AuditEvent::new(AuditEventType::LoginFailure)
///     .user("u-42")
///     .ip("203.0.113.7")
///     .with("reason", "bad password");
/// assert_eq!(event.resolved_severity(), Severity::High);
/// ```
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: Option<Severity>,
    pub actor: Actor,
    pub context: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            severity: None,
            actor: Actor::anonymous(),
            context: Map::new(),
        }
    }

    /// Override the table severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.actor.user_id = Some(user_id.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.actor.ip = Some(ip.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Merge `context` into the event, keeping keys already set.
    pub fn context(mut self, context: Map<String, Value>) -> Self {
        for (key, value) in context {
            self.context.entry(key).or_insert(value);
        }
        self
    }

    pub fn resolved_severity(&self) -> Severity {
        self.severity.unwrap_or_else(|| self.event_type.severity())
    }
}

/// A logged event. Records are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event: AuditEventType,
    pub severity: Severity,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub context: Map<String, Value>,
}
