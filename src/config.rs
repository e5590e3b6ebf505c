//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `APP_ENV`: `development` or `production`; selects the CSP and the cookie `Secure` flag
//! - `CSRF_EXEMPT_PATHS`: prefixes whose unsafe requests skip CSRF verification
//! - `TRUSTED_PROXIES`: CIDR ranges whose `X-Forwarded-For` is believed
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*` for dev)
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_MAX`: requests per window (default: 100, 0 disables)
//! - `RATE_LIMIT_WINDOW_MS`: window length (default: 60000)
//! - `RATE_LIMIT_RULES`: per-route overrides, `prefix=max/window_ms,...`

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::audit::AuditSettings;
use crate::csrf::CsrfSettings;
use crate::error::{AppError, AppResult};
use crate::middleware::{RouteClassifier, SecurityHeaders, TrustedProxyConfig};
use crate::rate_limit::{Quota, RateLimitRules};

const DEFAULT_CSRF_EXEMPT_PATHS: &str = "/api/auth,/api/health,/api/register,/api/verify-email";
const DEFAULT_STATIC_PATH_PREFIXES: &str = "/_next/static,/_next/image,/static/,/favicon.ico";

/// Deployment environment. Resolved once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("expected development or production, got '{other}'")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracing output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected pretty or json, got '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        })
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment (default: development)
    pub environment: Environment,

    /// Maximum request body size in bytes (default: 1MB).
    /// Also bounds body buffering when looking for a CSRF field.
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Default quota plus per-route overrides
    pub rate_limit_rules: RateLimitRules,

    /// Interval of the background counter eviction (default: 60 seconds)
    pub rate_limit_sweep_interval: Duration,

    /// Bound on every counter-store and token-store call (default: 250ms)
    pub store_timeout: Duration,

    /// Redis URL for shared counters; used only with the `redis-store` feature
    pub redis_url: Option<String>,

    // =========================================================================
    // CSRF Configuration
    // =========================================================================
    /// Token lifetime (default: 24 hours)
    pub csrf_token_ttl: Duration,

    /// Path prefixes exempt from CSRF verification
    pub csrf_exempt_paths: Vec<String>,

    // =========================================================================
    // Routing and Proxy Configuration
    // =========================================================================
    /// Path prefixes served as static assets; they skip the pipeline
    pub static_path_prefixes: Vec<String>,

    /// Trusted proxy CIDR ranges.
    /// X-Forwarded-For headers are only trusted if the connection
    /// originates from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarding headers from connected peers are ignored)
    pub trusted_proxies: Vec<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Audit Configuration
    // =========================================================================
    /// Per-callback bound for alert dispatch (default: 2 seconds)
    pub alert_callback_timeout: Duration,

    /// Records kept in memory for `/api/audit/recent` (default: 1000)
    pub audit_trail_capacity: usize,

    /// Serve `/api/audit/recent` (default: on in development, off in production)
    pub audit_api_enabled: bool,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Tracing output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value is invalid
    /// (e.g., non-numeric PORT value, malformed rate-limit rule).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let default_quota = Quota::new(
            Self::parse_env("RATE_LIMIT_MAX", 100)?,
            Duration::from_millis(Self::parse_env("RATE_LIMIT_WINDOW_MS", 60_000)?),
        );
        let rate_limit_rules =
            RateLimitRules::parse(default_quota, &env::var("RATE_LIMIT_RULES").unwrap_or_default())
                .map_err(|e| AppError::ConfigError(format!("Invalid RATE_LIMIT_RULES: {e}")))?;

        let environment: Environment = Self::parse_env("APP_ENV", Environment::Development)?;

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            environment,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Rate limiting
            rate_limit_rules,
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),
            store_timeout: Duration::from_millis(Self::parse_env("STORE_TIMEOUT_MS", 250)?),
            redis_url: env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),

            // CSRF
            csrf_token_ttl: Duration::from_secs(Self::parse_env("CSRF_TOKEN_TTL_SECS", 86_400)?),
            csrf_exempt_paths: Self::parse_path_list(
                "CSRF_EXEMPT_PATHS",
                DEFAULT_CSRF_EXEMPT_PATHS,
            ),

            // Routing and proxies
            static_path_prefixes: Self::parse_path_list(
                "STATIC_PATH_PREFIXES",
                DEFAULT_STATIC_PATH_PREFIXES,
            ),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),

            // Audit
            alert_callback_timeout: Duration::from_millis(Self::parse_env(
                "ALERT_CALLBACK_TIMEOUT_MS",
                2000,
            )?),
            audit_trail_capacity: Self::parse_env("AUDIT_TRAIL_CAPACITY", 1000)?,
            audit_api_enabled: Self::parse_env("AUDIT_API_ENABLED", !environment.is_production())?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.rate_limit_rules.default_quota().window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_MS must be greater than 0".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.csrf_token_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "CSRF_TOKEN_TTL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.environment.is_production() && self.cors_allowed_origins.iter().any(|o| o == "*") {
            tracing::warn!("CORS_ALLOWED_ORIGINS is '*' in production");
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled for the default rule.
    pub fn rate_limiting_enabled(&self) -> bool {
        !self.rate_limit_rules.default_quota().is_disabled()
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    pub fn csrf_settings(&self) -> CsrfSettings {
        CsrfSettings {
            token_ttl: self.csrf_token_ttl,
            exempt_paths: self.csrf_exempt_paths.clone(),
            secure_cookies: self.environment.is_production(),
            store_timeout: self.store_timeout,
        }
    }

    pub fn audit_settings(&self) -> AuditSettings {
        AuditSettings {
            trail_capacity: self.audit_trail_capacity,
            callback_timeout: self.alert_callback_timeout,
        }
    }

    pub fn security_headers(&self) -> SecurityHeaders {
        SecurityHeaders::new(self.environment)
    }

    pub fn route_classifier(&self) -> RouteClassifier {
        RouteClassifier::new(self.static_path_prefixes.clone())
    }

    pub fn trusted_proxy_config(&self) -> TrustedProxyConfig {
        TrustedProxyConfig::new(&self.trusted_proxies)
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Comma-separated list with blanks removed.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Comma-separated path prefixes; entries not starting with `/` are dropped.
    fn parse_path_list(name: &str, default: &str) -> Vec<String> {
        Self::parse_list(name, default)
            .into_iter()
            .filter(|p| p.starts_with('/'))
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        let split = |s: &str| s.split(',').map(String::from).collect::<Vec<_>>();
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: Environment::Development,
            max_request_body_size: 1024 * 1024,
            // Rate limiting
            rate_limit_rules: RateLimitRules::new(Quota::new(100, Duration::from_secs(60))),
            rate_limit_sweep_interval: Duration::from_secs(60),
            store_timeout: Duration::from_millis(250),
            redis_url: None,
            // CSRF
            csrf_token_ttl: Duration::from_secs(86_400),
            csrf_exempt_paths: split(DEFAULT_CSRF_EXEMPT_PATHS),
            // Routing and proxies
            static_path_prefixes: split(DEFAULT_STATIC_PATH_PREFIXES),
            trusted_proxies: vec![],
            cors_allowed_origins: vec!["*".to_string()],
            // Audit
            alert_callback_timeout: Duration::from_secs(2),
            audit_trail_capacity: 1000,
            audit_api_enabled: true,
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
