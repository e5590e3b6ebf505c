//! `GET /api/audit/recent` - recent records from the in-memory trail.
//!
//! Filters: `event`, `userId`, `ip`, `minSeverity`, `since`, `until`, `limit`.

use axum::Json;
use axum::extract::{Query, State};
use tracing::instrument;

use crate::audit::AuditQuery;
use crate::models::AuditRecordsResponse;
use crate::state::AppState;

#[instrument(skip(state))]
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<AuditRecordsResponse> {
    let records: Vec<_> = state
        .audit
        .search(&query)
        .await
        .into_iter()
        .map(|record| (*record).clone())
        .collect();

    Json(AuditRecordsResponse {
        count: records.len(),
        records,
    })
}
