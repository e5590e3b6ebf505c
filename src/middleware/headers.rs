//! Security response headers.
//!
//! The header set, including the Content-Security-Policy, is resolved once
//! from the deployment [`Environment`] at startup. Development allows
//! `'unsafe-eval'` and `'unsafe-inline'` for hot-reload tooling; production
//! drops both and upgrades insecure requests.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::Environment;

pub const RESPONSE_TIME_HEADER: &str = "x-response-time";

const PERMISSIONS_POLICY: &str =
    "camera=(), microphone=(), geolocation=(), payment=(), usb=(), interest-cohort=()";

const DEVELOPMENT_CSP: &[&str] = &[
    "default-src 'self'",
    "script-src 'self' 'unsafe-eval' 'unsafe-inline'",
    "style-src 'self' 'unsafe-inline'",
    "img-src 'self' data: blob: https:",
    "font-src 'self' data:",
    "connect-src 'self' ws: wss:",
    "frame-ancestors 'none'",
    "base-uri 'self'",
    "form-action 'self'",
    "object-src 'none'",
];

const PRODUCTION_CSP: &[&str] = &[
    "default-src 'self'",
    "script-src 'self'",
    "style-src 'self'",
    "img-src 'self' data: https:",
    "font-src 'self'",
    "connect-src 'self'",
    "frame-ancestors 'none'",
    "base-uri 'self'",
    "form-action 'self'",
    "object-src 'none'",
    "upgrade-insecure-requests",
];

/// Build the Content-Security-Policy for an environment.
pub fn content_security_policy(environment: Environment) -> String {
    match environment {
        Environment::Development => DEVELOPMENT_CSP.join("; "),
        Environment::Production => PRODUCTION_CSP.join("; "),
    }
}

/// Precomputed header set attached to every non-static response.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    environment: Environment,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl SecurityHeaders {
    pub fn new(environment: Environment) -> Self {
        let csp = content_security_policy(environment);
        let headers = [
            ("x-frame-options", "DENY"),
            ("x-content-type-options", "nosniff"),
            ("x-xss-protection", "1; mode=block"),
            ("referrer-policy", "strict-origin-when-cross-origin"),
            ("permissions-policy", PERMISSIONS_POLICY),
            ("content-security-policy", csp.as_str()),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            Some((
                HeaderName::from_static(name),
                HeaderValue::from_str(value).ok()?,
            ))
        })
        .collect();

        Self {
            environment,
            headers,
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Write the security headers, replacing any the handler set.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Stamp `X-Response-Time` in whole milliseconds.
    pub fn apply_response_time(headers: &mut HeaderMap, elapsed: Duration) {
        if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
            headers.insert(RESPONSE_TIME_HEADER, value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_development_csp_allows_tooling() {
        let csp = content_security_policy(Environment::Development);
        assert!(csp.contains("'unsafe-eval'"));
        assert!(csp.contains("'unsafe-inline'"));
        assert!(!csp.contains("upgrade-insecure-requests"));
    }

    #[test]
    fn test_production_csp_is_strict() {
        let csp = content_security_policy(Environment::Production);
        assert!(csp.starts_with("default-src 'self'"));
        assert!(!csp.contains("unsafe-eval"));
        assert!(!csp.contains("unsafe-inline"));
        assert!(csp.contains("upgrade-insecure-requests"));
    }

    #[test]
    fn test_apply_sets_all_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
        SecurityHeaders::new(Environment::Production).apply(&mut headers);

        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(
            headers["permissions-policy"]
                .to_str()
                .unwrap()
                .contains("camera=()")
        );
        assert!(headers.contains_key("content-security-policy"));
    }

    #[test]
    fn test_response_time_format() {
        let mut headers = HeaderMap::new();
        SecurityHeaders::apply_response_time(&mut headers, Duration::from_micros(12_500));
        assert_eq!(headers[RESPONSE_TIME_HEADER], "12ms");
    }
}
