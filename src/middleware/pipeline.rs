//! The per-request security pipeline as a tower layer.
//!
//! # Stages
//!
//! ```text
//! Received ─► RouteClassified ─┬─ static ─────────────────────────────────────────► Returned
//!                              └─► RateChecked ─► CsrfChecked ─► QuerySanitized ─► Forwarded
//!                                      │ 429          │ 403           │ 307            │
//!                                      └──────────────┴───────────────┴───────► HeadersAttached ─► Returned
//! ```
//!
//! Static assets are handed straight to the inner service. Every other
//! response, rejections included, carries the security headers and
//! `X-Response-Time`.
//!
//! # Failure policy
//!
//! - Counter store unavailable: fail open, audit `STORE_UNAVAILABLE`
//! - CSRF token store unavailable: fail closed (403)
//! - Alert callback failures never reach the response

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{Request, Response};
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::context::SecurityRequestContext;
use super::headers::SecurityHeaders;
use super::ip::{TrustedProxyConfig, client_ip};
use super::request_id::RequestIdExt;
use super::route::{RouteClass, RouteClassifier};
use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::csrf::{CSRF_HEADER, CsrfProtection, token_from_body};
use crate::error::SecurityError;
use crate::identity::{Identity, IdentityProvider};
use crate::metrics;
use crate::rate_limit::{RateLimitRules, RateLimiter};
use crate::sanitize::QuerySanitizer;

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Received,
    RouteClassified,
    RateChecked,
    CsrfChecked,
    QuerySanitized,
    Forwarded,
    HeadersAttached,
    Returned,
}

/// Label recorded on the duration histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Static,
    Forwarded,
    RateLimited,
    CsrfRejected,
    Redirected,
}

impl PipelineOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineOutcome::Static => "static",
            PipelineOutcome::Forwarded => "forwarded",
            PipelineOutcome::RateLimited => "rate_limited",
            PipelineOutcome::CsrfRejected => "csrf_rejected",
            PipelineOutcome::Redirected => "redirected",
        }
    }
}

struct Progress<'a> {
    state: PipelineState,
    correlation_id: &'a str,
}

impl Progress<'_> {
    fn advance(&mut self, next: PipelineState) {
        debug_assert!(next > self.state, "{:?} -> {next:?}", self.state);
        trace!(
            request_id = %self.correlation_id,
            from = ?self.state,
            to = ?next,
            "Security pipeline transition"
        );
        self.state = next;
    }
}

enum Verdict {
    Forward(Request<Body>),
    Reject(PipelineOutcome, Response<Body>),
}

/// Collaborators shared by every request.
pub struct SecurityPipeline {
    pub routes: RouteClassifier,
    pub trusted_proxies: TrustedProxyConfig,
    pub identity: Arc<dyn IdentityProvider>,
    pub rate_limiter: RateLimiter,
    pub rate_limit_rules: RateLimitRules,
    pub csrf: CsrfProtection,
    pub query: QuerySanitizer,
    pub audit: AuditLogger,
    pub headers: SecurityHeaders,
    /// Upper bound when buffering a body to look for a CSRF field.
    pub max_body_size: usize,
    /// Bound on the identity (session) lookup.
    pub store_timeout: Duration,
}

impl SecurityPipeline {
    async fn process<S>(
        self: Arc<Self>,
        mut inner: S,
        req: Request<Body>,
    ) -> Result<Response<Body>, S::Error>
    where
        S: Service<Request<Body>, Response = Response<Body>>,
    {
        let started = Instant::now();
        let correlation_id = req.correlation_id().0;
        let mut progress = Progress {
            state: PipelineState::Received,
            correlation_id: &correlation_id,
        };

        if self.routes.classify(req.uri().path()) == RouteClass::Static {
            progress.advance(PipelineState::Returned);
            let response = inner.call(req).await?;
            metrics::record_pipeline_duration(
                PipelineOutcome::Static.as_str(),
                started.elapsed().as_secs_f64(),
            );
            return Ok(response);
        }
        progress.advance(PipelineState::RouteClassified);

        let ip = client_ip(&req, &self.trusted_proxies);
        let (mut parts, body) = req.into_parts();
        let mut ctx = SecurityRequestContext::from_parts(&parts, ip, correlation_id.clone());
        ctx.identity = self.resolve_identity(&ctx).await;
        parts.extensions.insert(ctx.identity.clone());

        let (outcome, mut response) = match self.guard(&ctx, parts, body, &mut progress).await {
            Verdict::Forward(req) => {
                progress.advance(PipelineState::Forwarded);
                (PipelineOutcome::Forwarded, inner.call(req).await?)
            }
            Verdict::Reject(outcome, response) => (outcome, response),
        };

        self.headers.apply(response.headers_mut());
        progress.advance(PipelineState::HeadersAttached);

        let elapsed = started.elapsed();
        SecurityHeaders::apply_response_time(response.headers_mut(), elapsed);
        progress.advance(PipelineState::Returned);
        metrics::record_pipeline_duration(outcome.as_str(), elapsed.as_secs_f64());

        Ok(response)
    }

    /// Rate limit, CSRF and query stages, in that order.
    async fn guard(
        &self,
        ctx: &SecurityRequestContext,
        parts: Parts,
        body: Body,
        progress: &mut Progress<'_>,
    ) -> Verdict {
        if let Some(rejection) = self.check_rate_limit(ctx).await {
            return Verdict::Reject(PipelineOutcome::RateLimited, rejection);
        }
        progress.advance(PipelineState::RateChecked);

        let body = if self.csrf.requires_verification(&ctx.method, &ctx.path) {
            let (submitted, body) = self.submitted_token(ctx, body).await;
            if let Err(reason) = self.csrf.verify(ctx, submitted.as_deref()).await {
                let error = SecurityError::CsrfValidationFailed { reason };
                return Verdict::Reject(
                    PipelineOutcome::CsrfRejected,
                    error.to_response(&ctx.correlation_id),
                );
            }
            body
        } else {
            body
        };
        progress.advance(PipelineState::CsrfChecked);

        if let Some(redirect) = self.check_query(ctx).await {
            return Verdict::Reject(PipelineOutcome::Redirected, redirect);
        }
        progress.advance(PipelineState::QuerySanitized);

        Verdict::Forward(Request::from_parts(parts, body))
    }

    /// Caller identity from the provider, bounded by `store_timeout`.
    ///
    /// A stalled lookup degrades to anonymous: the request is keyed by
    /// client IP, and a token bound to a user no longer verifies.
    async fn resolve_identity(&self, ctx: &SecurityRequestContext) -> Identity {
        let lookup = self.identity.identify(&ctx.headers, &ctx.cookies);
        if let Ok(identity) = tokio::time::timeout(self.store_timeout, lookup).await {
            return identity;
        }

        let error = SecurityError::UpstreamStoreTimeout { store: "session" };
        warn!(
            timeout = ?self.store_timeout,
            path = %ctx.path,
            "Session lookup timed out, treating caller as anonymous"
        );
        metrics::record_store_degraded("session");
        self.audit
            .log(
                AuditEvent::new(AuditEventType::StoreUnavailable)
                    .actor(ctx.actor())
                    .with("store", "session")
                    .with("error", error.to_string())
                    .with("policy", "anonymous")
                    .context(ctx.audit_context()),
            )
            .await;
        Identity::anonymous()
    }

    async fn check_rate_limit(&self, ctx: &SecurityRequestContext) -> Option<Response<Body>> {
        let (rule, quota) = self.rate_limit_rules.resolve(&ctx.path);
        let key = format!("{}:{rule}", ctx.rate_limit_subject());

        match self.rate_limiter.check(&key, quota).await {
            Ok(decision) => {
                let error = decision.into_error()?;
                warn!(
                    identifier = %key,
                    path = %ctx.path,
                    limit = decision.limit,
                    retry_after_secs = decision.retry_after_secs,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited(rule);
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::RateLimitExceeded)
                            .actor(ctx.actor())
                            .with("identifier", key.as_str())
                            .with("rule", rule)
                            .with("limit", decision.limit)
                            .context(ctx.audit_context()),
                    )
                    .await;
                Some(error.to_response(&ctx.correlation_id))
            }
            Err(error) => {
                warn!(
                    error = %error,
                    store = self.rate_limiter.store_name(),
                    path = %ctx.path,
                    "Rate limit store unavailable, allowing request"
                );
                metrics::record_store_degraded("rate_limit");
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::StoreUnavailable)
                            .actor(ctx.actor())
                            .with("store", self.rate_limiter.store_name())
                            .with("error", error.to_string())
                            .with("policy", "fail_open")
                            .context(ctx.audit_context()),
                    )
                    .await;
                None
            }
        }
    }

    /// Token from `X-CSRF-Token`, else from a buffered JSON or form body.
    ///
    /// The body is handed back for the downstream handler. A body over the
    /// size bound is dropped and yields no token.
    async fn submitted_token(
        &self,
        ctx: &SecurityRequestContext,
        body: Body,
    ) -> (Option<String>, Body) {
        if let Some(token) = ctx.header(CSRF_HEADER) {
            return (Some(token.to_string()), body);
        }

        match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(bytes) => {
                let token = token_from_body(ctx.content_type(), &bytes);
                (token, Body::from(bytes))
            }
            Err(error) => {
                debug!(error = %error, path = %ctx.path, "Could not buffer body for CSRF field");
                (None, Body::from(Bytes::new()))
            }
        }
    }

    async fn check_query(&self, ctx: &SecurityRequestContext) -> Option<Response<Body>> {
        let sanitized = self.query.sanitize(&ctx.path, ctx.query.as_deref()?)?;

        warn!(
            path = %ctx.path,
            parameters = ?sanitized.flagged,
            client_ip = %ctx.client_ip,
            "Dangerous query parameters, redirecting to sanitized URL"
        );
        metrics::record_sanitization_redirect();
        self.audit
            .log(
                AuditEvent::new(AuditEventType::XssAttempt)
                    .actor(ctx.actor())
                    .with(
                        "parameters",
                        Value::from(sanitized.flagged.clone()),
                    )
                    .with("location", sanitized.location.as_str())
                    .context(ctx.audit_context()),
            )
            .await;

        let redirect = SecurityError::SanitizationRedirect {
            location: sanitized.location,
        };
        Some(redirect.to_response(&ctx.correlation_id))
    }
}

/// Tower layer running [`SecurityPipeline`] around the router.
#[derive(Clone)]
pub struct SecurityLayer {
    pipeline: Arc<SecurityPipeline>,
}

impl SecurityLayer {
    pub fn new(pipeline: SecurityPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn pipeline(&self) -> &SecurityPipeline {
        &self.pipeline
    }
}

impl<S> Layer<S> for SecurityLayer {
    type Service = SecurityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityService<S> {
    inner: S,
    pipeline: Arc<SecurityPipeline>,
}

impl<S> Service<Request<Body>> for SecurityService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness and leave a clone behind
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let pipeline = self.pipeline.clone();

        Box::pin(pipeline.process(inner, req))
    }
}
