use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::audit::AuditRecord;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: String,
    /// Application version
    pub version: String,
    /// Deployment environment the CSP was resolved for
    pub environment: String,
    /// Counter store backing the rate limiter
    pub rate_limit_store: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
}

/// Body of `GET /api/csrf`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfTokenResponse {
    pub token: String,
    /// Header the token must be echoed in
    pub header: &'static str,
    pub expires_at: DateTime<Utc>,
}

/// Body of `GET /api/audit/recent`.
#[derive(Debug, Serialize)]
pub struct AuditRecordsResponse {
    pub count: usize,
    pub records: Vec<AuditRecord>,
}

/// Body of `POST /api/posts`: the submitted document after sanitization.
#[derive(Debug, Serialize)]
pub struct PostResponse {
    pub post: Value,
    pub created_at: DateTime<Utc>,
}

/// Body of `GET /api/posts`.
///
/// Echoes the query parameters the handler received, which never contain
/// markup because dangerous queries are redirected first.
#[derive(Debug, Serialize)]
pub struct PostListResponse {
    pub query: BTreeMap<String, String>,
    pub posts: Vec<Value>,
}
