//! # Request Guard
//!
//! A request-time security pipeline for Axum services:
//!
//! - **Rate limiting**: fixed-window counters per user or client IP and route,
//!   over an in-memory or Redis store
//! - **CSRF protection**: session-bound double-submit tokens with constant-time comparison
//! - **Sanitization**: allowlist HTML, URL, Markdown and JSON cleaning, plus
//!   redirects away from dangerous query strings
//! - **Audit logging**: severity-classified structured records with alert callbacks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request ID → Trace → CORS → SecurityLayer                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SecurityLayer: route class → rate limit → CSRF → query     │
//! │                 → handler → security headers                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimiter │ CsrfProtection │ Sanitizers │ AuditLogger    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimitStore (memory / Redis) │ CsrfTokenStore │ Clock   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_guard::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::in_memory(config)?;
//!     let app = build_router(state.clone());
//!
//!     // Start the server...
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! ```bash
//! APP_ENV=production RATE_LIMIT_RULES="/api/auth=5/60000" TRUSTED_PROXIES=10.0.0.0/8 cargo run
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod sanitize;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditEventType, AuditLogger, Severity};
pub use config::{Config, Environment};
pub use csrf::CsrfProtection;
pub use error::{AppError, AppResult, SecurityError};
pub use rate_limit::{Quota, RateLimiter};
pub use routes::build_router;
pub use state::AppState;
