mod api;

pub use api::{
    AuditRecordsResponse, CsrfTokenResponse, HealthResponse, PostListResponse, PostResponse,
};
