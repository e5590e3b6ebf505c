//! Health and readiness endpoints.
//!
//! - `GET /health` - Liveness with build and environment details
//! - `GET /ready` - 503 while the rate-limit counter store does not answer

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::models::HealthResponse;
use crate::rate_limit::Quota;
use crate::state::AppState;

const READINESS_KEY: &str = "readiness-check";

/// Health check endpoint. Always returns 200 OK.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "environment": "production",
///   "rate_limit_store": "memory",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment.to_string(),
        rate_limit_store: state.rate_limiter.store_name().to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes readiness checks.
///
/// Performs one bounded counter-store round trip. The pipeline fails open
/// when the store is down, so readiness is where the outage surfaces.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let quota = Quota::new(u32::MAX, Duration::from_secs(1));
    match state.rate_limiter.check(READINESS_KEY, quota).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
