//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Assigns X-Request-Id (correlation id)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response spans
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers, preflight
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Security pipeline│ ← 429 / 403 / 307, security headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Body size limit │
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring
//! - `/api/csrf` - Token issuance and rotation
//! - `/api/audit/recent` - Recent audit records (when enabled)
//! - `/api/posts` - Demonstration downstream handlers

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::RequestIdLayer;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);

    let mut router = Router::new()
        // Health and status endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // CSRF token endpoints
        .route(
            "/api/csrf",
            get(handlers::get_token).delete(handlers::rotate_token),
        )
        // Downstream demonstration
        .route(
            "/api/posts",
            get(handlers::list_posts).post(handlers::create_post),
        );

    if config.audit_api_enabled {
        router = router.route("/api/audit/recent", get(handlers::recent_events));
    } else {
        info!("Audit API disabled (AUDIT_API_ENABLED=false)");
    }

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit (prevents DoS via large payloads)
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Security pipeline
    info!(
        environment = %config.environment,
        default_limit = config.rate_limit_rules.default_quota().max,
        route_rules = config.rate_limit_rules.rules().len(),
        csrf_exempt = config.csrf_exempt_paths.len(),
        trusted_proxies = config.trusted_proxies.len(),
        "Security pipeline configured"
    );
    router = router.layer(state.security_layer());

    // 3. CORS
    router = router.layer(cors);

    // 4. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 5. Request ID
    router = router.layer(RequestIdLayer::new());

    router.with_state(state)
}

/// Build CORS layer from configuration.
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
