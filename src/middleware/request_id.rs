//! Correlation ids.
//!
//! Every request carries an `X-Request-Id`. A well-formed id supplied by the
//! client or an upstream proxy is kept; anything else is replaced by a fresh
//! UUIDv4. The id is stored in the request extensions as [`CorrelationId`],
//! recorded on the current tracing span, echoed on the response, and placed
//! in security error bodies and audit context.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let id = extract_or_generate(&req);
        // Only ids that passed validation get here, so the header is valid
        let header = HeaderValue::from_str(id.as_str()).ok();

        if let Some(value) = &header {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }
        req.extensions_mut().insert(id.clone());

        Span::current().record("request_id", id.as_str());
        debug!(request_id = %id.as_str(), "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Some(value) = header {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

fn is_well_formed(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn extract_or_generate<B>(req: &Request<B>) -> CorrelationId {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_well_formed(v))
        .map(|v| CorrelationId(v.to_string()))
        .unwrap_or_else(CorrelationId::generate)
}

/// Read the correlation id assigned by [`RequestIdLayer`].
pub trait RequestIdExt {
    /// The assigned id, or a freshly generated one when the layer did not run.
    fn correlation_id(&self) -> CorrelationId;
}

impl<B> RequestIdExt for Request<B> {
    fn correlation_id(&self) -> CorrelationId {
        self.extensions()
            .get::<CorrelationId>()
            .cloned()
            .unwrap_or_else(|| extract_or_generate(self))
    }
}
