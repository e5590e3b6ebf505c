use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;
use serde::Serialize;
use thiserror::Error;

use crate::csrf::CsrfFailure;

/// Errors raised by handlers and startup code.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Outcomes of the security pipeline that end or divert a request.
///
/// Every variant has a documented disposition. None of them escape the
/// middleware as a panic or an unhandled error.
///
/// - `RateLimitExceeded` - recoverable, the client retries after `retry_after_secs`
/// - `CsrfValidationFailed` - the client must fetch a fresh token
/// - `SanitizationRedirect` - control flow, not a failure
/// - `AuditDeliveryFailure` - one alert callback failed, isolated and never propagated
/// - `UpstreamStoreTimeout` / `Store` - degraded per store policy (fail-open counters,
///   fail-closed CSRF)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Rate limit of {limit} exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64, limit: u32 },

    #[error("CSRF validation failed: {reason}")]
    CsrfValidationFailed { reason: CsrfFailure },

    #[error("Query parameters sanitized, redirecting to {location}")]
    SanitizationRedirect { location: String },

    #[error("Alert callback '{callback}' failed: {message}")]
    AuditDeliveryFailure { callback: String, message: String },

    #[error("{store} store timed out")]
    UpstreamStoreTimeout { store: &'static str },

    #[error("{store} store error: {message}")]
    Store {
        store: &'static str,
        message: String,
    },
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Body returned with a 429.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitBody<'a> {
    error: &'static str,
    retry_after: u64,
    correlation_id: &'a str,
}

/// Body returned with a 403 or 503 from the security pipeline.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecurityErrorBody<'a> {
    error: &'static str,
    message: &'static str,
    code: &'static str,
    correlation_id: &'a str,
}

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests. Please try again later.";
pub const CSRF_ERROR_CODE: &str = "CSRF_VALIDATION_FAILED";

impl SecurityError {
    /// HTTP status this outcome maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            SecurityError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SecurityError::CsrfValidationFailed { .. } => StatusCode::FORBIDDEN,
            SecurityError::SanitizationRedirect { .. } => StatusCode::TEMPORARY_REDIRECT,
            SecurityError::AuditDeliveryFailure { .. }
            | SecurityError::UpstreamStoreTimeout { .. }
            | SecurityError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Render the client-facing response.
    ///
    /// Bodies are minimal JSON carrying only the correlation id, never the
    /// internal reason.
    pub fn to_response(&self, correlation_id: &str) -> Response<Body> {
        let status = self.status();
        match self {
            SecurityError::RateLimitExceeded {
                retry_after_secs,
                limit,
            } => (
                status,
                [
                    ("Retry-After", retry_after_secs.to_string()),
                    ("X-RateLimit-Limit", limit.to_string()),
                    ("X-RateLimit-Remaining", "0".to_string()),
                ],
                axum::Json(RateLimitBody {
                    error: RATE_LIMIT_MESSAGE,
                    retry_after: *retry_after_secs,
                    correlation_id,
                }),
            )
                .into_response(),
            SecurityError::CsrfValidationFailed { .. } => (
                status,
                axum::Json(SecurityErrorBody {
                    error: "CSRF validation failed",
                    message: "Invalid or missing CSRF token. Refresh the page and try again.",
                    code: CSRF_ERROR_CODE,
                    correlation_id,
                }),
            )
                .into_response(),
            SecurityError::SanitizationRedirect { location } => {
                let mut response = status.into_response();
                if let Ok(value) = HeaderValue::from_str(location) {
                    response.headers_mut().insert(header::LOCATION, value);
                }
                response
            }
            SecurityError::AuditDeliveryFailure { .. }
            | SecurityError::UpstreamStoreTimeout { .. }
            | SecurityError::Store { .. } => (
                status,
                axum::Json(SecurityErrorBody {
                    error: "Service temporarily unavailable",
                    message: "Please try again later.",
                    code: "SERVICE_UNAVAILABLE",
                    correlation_id,
                }),
            )
                .into_response(),
        }
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response<Body> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.to_response(&correlation_id)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response<Body> {
        // Log the full error details server-side, expose only sanitized messages
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::Security(e) => return e.clone().into_response(),
            AppError::SerializationError(e) => {
                let sanitized = sanitize_serde_error(e);
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(ErrorResponse {
                        error: "serialization_error".to_string(),
                        message: sanitized,
                        details: None,
                    }),
                )
                    .into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
            details: None,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Reduce a serde error to something safe to show a client.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limit_response_shape() {
        let err = SecurityError::RateLimitExceeded {
            retry_after_secs: 42,
            limit: 5,
        };
        let response = err.to_response("corr-1");

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");

        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("Too many requests")
        );
        assert_eq!(body["retryAfter"], 42);
        assert_eq!(body["correlationId"], "corr-1");
    }

    #[tokio::test]
    async fn test_csrf_response_hides_reason() {
        let err = SecurityError::CsrfValidationFailed {
            reason: CsrfFailure::SessionMismatch,
        };
        let response = err.to_response("corr-2");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["code"], CSRF_ERROR_CODE);
        assert!(!body.to_string().contains("session_mismatch"));
    }

    #[test]
    fn test_redirect_sets_location() {
        let err = SecurityError::SanitizationRedirect {
            location: "/search?q=hello".to_string(),
        };
        let response = err.to_response("corr-3");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()["location"], "/search?q=hello");
    }

    #[test]
    fn test_store_errors_map_to_503() {
        let err = SecurityError::UpstreamStoreTimeout { store: "counter" };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.to_string(), "counter store timed out");
    }

    #[test]
    fn test_sanitize_serde_error_missing_field() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Malformed JSON in request body");
    }
}
