//! HTTP middleware for the security pipeline and request correlation.
//!
//! - **Security pipeline**: route classification, fixed-window rate limiting,
//!   CSRF verification, query sanitization and response headers, in one layer
//! - **Request ID**: correlation id generation and propagation
//! - **Client IP**: trusted-proxy aware address resolution
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → CORS → Security pipeline → Handler
//!                                                ↓    ↓    ↓
//!                                              429  403  307 (sanitized query)
//! ```

pub mod context;
pub mod headers;
pub mod ip;
pub mod pipeline;
pub mod request_id;
pub mod route;

pub use context::SecurityRequestContext;
pub use headers::{RESPONSE_TIME_HEADER, SecurityHeaders, content_security_policy};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use pipeline::{PipelineOutcome, PipelineState, SecurityLayer, SecurityPipeline};
pub use request_id::{CorrelationId, REQUEST_ID_HEADER, RequestIdExt, RequestIdLayer};
pub use route::{RouteClass, RouteClassifier};
