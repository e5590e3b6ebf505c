//! Demonstration downstream handlers.
//!
//! They run only after every pipeline stage has passed. `POST /api/posts`
//! returns the submitted document with every string leaf sanitized;
//! `GET /api/posts` echoes the (already clean) query parameters.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use crate::audit::{AuditEvent, AuditEventType};
use crate::csrf::BODY_FIELDS;
use crate::identity::Identity;
use crate::models::{PostListResponse, PostResponse};
use crate::sanitize::sanitize_json;
use crate::state::AppState;

#[instrument(skip_all)]
pub async fn create_post(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<PostResponse>) {
    if let Value::Object(fields) = &mut body {
        fields.retain(|key, _| !BODY_FIELDS.contains(&key.as_str()));
    }
    let post = sanitize_json(&body);

    let mut event = AuditEvent::new(AuditEventType::PostCreate);
    if let Some(user_id) = identity.and_then(|Extension(i)| i.user_id) {
        event = event.user(user_id);
    }
    state.audit.log(event).await;

    (
        StatusCode::CREATED,
        Json(PostResponse {
            post,
            created_at: Utc::now(),
        }),
    )
}

#[instrument(skip_all)]
pub async fn list_posts(Query(query): Query<BTreeMap<String, String>>) -> Json<PostListResponse> {
    Json(PostListResponse {
        query,
        posts: Vec::new(),
    })
}
