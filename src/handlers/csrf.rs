//! CSRF token issuance.
//!
//! - `GET /api/csrf` returns the session's token, minting one when absent,
//!   expired or bound to another user
//! - `DELETE /api/csrf` rotates it (login, logout, privilege change)
//!
//! Both set the `csrf-session` and `csrf-token` cookies and echo the token
//! in `X-CSRF-Token`.

use axum::Json;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

use crate::csrf::cookie::parse_cookies;
use crate::csrf::{CSRF_HEADER, CsrfToken, SESSION_COOKIE};
use crate::error::SecurityError;
use crate::identity::Identity;
use crate::middleware::CorrelationId;
use crate::models::CsrfTokenResponse;
use crate::state::AppState;

/// Issue or reuse the session's token.
#[instrument(skip_all)]
pub async fn get_token(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    correlation_id: Option<Extension<CorrelationId>>,
    headers: HeaderMap,
) -> Response {
    let cookies = parse_cookies(&headers);
    let user_id = user_id(identity.as_ref());

    match state
        .csrf
        .issue(cookies.get(SESSION_COOKIE).map(String::as_str), user_id)
        .await
    {
        Ok(issued) => {
            debug!(reused = issued.reused, "CSRF token served");
            token_response(&state, &issued.token)
        }
        Err(e) => error_response(&e, correlation_id),
    }
}

/// Replace the session's token with a fresh one.
#[instrument(skip_all)]
pub async fn rotate_token(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    correlation_id: Option<Extension<CorrelationId>>,
    headers: HeaderMap,
) -> Response {
    let cookies = parse_cookies(&headers);
    let user_id = user_id(identity.as_ref());

    match state
        .csrf
        .rotate(cookies.get(SESSION_COOKIE).map(String::as_str), user_id)
        .await
    {
        Ok(token) => token_response(&state, &token),
        Err(e) => error_response(&e, correlation_id),
    }
}

fn user_id(identity: Option<&Extension<Identity>>) -> Option<&str> {
    identity.and_then(|Extension(identity)| identity.user_id.as_deref())
}

fn token_response(state: &AppState, token: &CsrfToken) -> Response {
    let mut headers = HeaderMap::new();
    for cookie in state.csrf.set_cookies(token) {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&token.value) {
        headers.insert(HeaderName::from_static(CSRF_HEADER), value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    let body = CsrfTokenResponse {
        token: token.value.clone(),
        header: CSRF_HEADER,
        expires_at: token.expires_at,
    };
    (headers, Json(body)).into_response()
}

fn error_response(
    error: &SecurityError,
    correlation_id: Option<Extension<CorrelationId>>,
) -> Response {
    let correlation_id = correlation_id
        .map(|Extension(id)| id)
        .unwrap_or_else(CorrelationId::generate);
    error.to_response(correlation_id.as_str())
}
