use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::event::AuditRecord;

/// Failure reported by an alert subscriber.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AlertError(pub String);

impl From<&str> for AlertError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AlertError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Subscriber notified of HIGH and CRITICAL audit records.
#[async_trait]
pub trait AlertCallback: Send + Sync + 'static {
    /// Label used in logs when delivery fails.
    fn name(&self) -> &str {
        "alert-callback"
    }

    async fn on_alert(&self, record: Arc<AuditRecord>) -> Result<(), AlertError>;
}

/// Adapter turning an async closure into an [`AlertCallback`].
pub struct FnAlert<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnAlert<F>
where
    F: Fn(Arc<AuditRecord>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AlertError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> AlertCallback for FnAlert<F>
where
    F: Fn(Arc<AuditRecord>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AlertError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_alert(&self, record: Arc<AuditRecord>) -> Result<(), AlertError> {
        (self.f)(record).await
    }
}
