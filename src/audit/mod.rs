//! Severity-classified security audit log with alert dispatch.
//!
//! # Delivery Semantics
//!
//! | Severity | Structured write | Alert callbacks |
//! |----------|------------------|-----------------|
//! | LOW      | yes              | none            |
//! | MEDIUM   | yes              | none            |
//! | HIGH     | yes              | spawned, not awaited |
//! | CRITICAL | yes              | awaited before `log()` returns |
//!
//! Records are written as `tracing` events on the `audit` target with the
//! fields `event`, `severity`, `actor`, `timestamp` and `context`, so a log
//! pipeline can filter on them without parsing text.
//!
//! Callbacks are held in an [`ArcSwap`] snapshot. Registration publishes a
//! new list while in-flight dispatches keep iterating the one they loaded.
//! Each callback runs in its own task under a timeout; a failing, slow or
//! panicking subscriber is reported and skipped without affecting the others.

mod alert;
mod anomaly;
mod event;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use alert::{AlertCallback, AlertError, FnAlert};
pub use anomaly::{ANOMALY_WINDOW_MS, Anomaly, AnomalyDetector};
pub use event::{Actor, AuditEvent, AuditEventType, AuditRecord, Severity};

use crate::clock::SharedClock;
use crate::error::SecurityError;
use crate::metrics;

/// Tracing target for audit records.
pub const AUDIT_TARGET: &str = "audit";

/// Tunables for [`AuditLogger`].
#[derive(Debug, Clone)]
pub struct AuditSettings {
    /// Records kept in memory for [`AuditLogger::search`]
    pub trail_capacity: usize,
    /// Bound on each alert callback
    pub callback_timeout: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            trail_capacity: 1000,
            callback_timeout: Duration::from_secs(2),
        }
    }
}

/// Search filter for the in-memory trail.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub event: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

const DEFAULT_SEARCH_LIMIT: usize = 100;

impl AuditQuery {
    fn matches(&self, record: &AuditRecord) -> bool {
        self.event.is_none_or(|e| e == record.event)
            && self
                .user_id
                .as_deref()
                .is_none_or(|u| record.actor.user_id.as_deref() == Some(u))
            && self
                .ip
                .as_deref()
                .is_none_or(|ip| record.actor.ip.as_deref() == Some(ip))
            && self.min_severity.is_none_or(|s| record.severity >= s)
            && self.since.is_none_or(|t| record.timestamp >= t)
            && self.until.is_none_or(|t| record.timestamp <= t)
    }
}

/// Result of fanning a record out to the registered callbacks.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failures: Vec<SecurityError>,
}

type CallbackList = Vec<Arc<dyn AlertCallback>>;

/// Process-wide audit logger. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

struct Inner {
    callbacks: ArcSwap<CallbackList>,
    trail: RwLock<VecDeque<Arc<AuditRecord>>>,
    detector: AnomalyDetector,
    clock: SharedClock,
    settings: AuditSettings,
    tasks: TaskTracker,
}

macro_rules! emit_record {
    ($level:ident, $record:expr, $context:expr) => {
        $level!(
            target: AUDIT_TARGET,
            id = %$record.id,
            event = $record.event.as_str(),
            severity = $record.severity.as_str(),
            actor = %$record.actor,
            timestamp = %$record.timestamp.to_rfc3339(),
            context = %$context,
            "Security audit event"
        )
    };
}

impl AuditLogger {
    pub fn new(settings: AuditSettings, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                callbacks: ArcSwap::from_pointee(Vec::new()),
                trail: RwLock::new(VecDeque::with_capacity(settings.trail_capacity.min(4096))),
                detector: AnomalyDetector::new(),
                clock,
                settings,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Append a subscriber. Registering the same callback twice makes it fire twice.
    pub fn register_alert_callback(&self, callback: Arc<dyn AlertCallback>) {
        self.inner.callbacks.rcu(|current| {
            let mut next = CallbackList::clone(current);
            next.push(callback.clone());
            next
        });
        debug!(
            name = callback.name(),
            total = self.callback_count(),
            "Alert callback registered"
        );
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.load().len()
    }

    /// Record an event.
    ///
    /// Returns once the structured write is done and, for CRITICAL records,
    /// once every registered callback has finished or timed out.
    pub async fn log(&self, event: AuditEvent) -> Arc<AuditRecord> {
        let record = self.write(event).await;
        self.alert(&record).await;

        if let Some(anomaly) = record
            .actor
            .key()
            .and_then(|key| {
                self.inner
                    .detector
                    .observe(record.event, key, self.inner.clock.now_millis())
            })
        {
            let flagged = self
                .write(
                    AuditEvent::new(AuditEventType::SuspiciousActivity)
                        .severity(Severity::Critical)
                        .actor(record.actor.clone())
                        .with("originalEvent", anomaly.event.as_str())
                        .with("count", anomaly.count)
                        .with("threshold", anomaly.threshold)
                        .with("timeWindow", "1 hour"),
                )
                .await;
            self.alert(&flagged).await;
        }

        record
    }

    async fn write(&self, event: AuditEvent) -> Arc<AuditRecord> {
        let severity = event.resolved_severity();
        let record = Arc::new(AuditRecord {
            id: Uuid::new_v4(),
            event: event.event_type,
            severity,
            actor: event.actor,
            timestamp: self.inner.clock.now_utc(),
            context: event.context,
        });

        let context = Value::Object(record.context.clone());
        match severity {
            Severity::Low | Severity::Medium => emit_record!(info, record, context),
            Severity::High => emit_record!(warn, record, context),
            Severity::Critical => emit_record!(error, record, context),
        }
        metrics::record_audit_event(severity.as_str());

        let capacity = self.inner.settings.trail_capacity;
        if capacity > 0 {
            let mut trail = self.inner.trail.write().await;
            while trail.len() >= capacity {
                trail.pop_front();
            }
            trail.push_back(record.clone());
        }

        record
    }

    async fn alert(&self, record: &Arc<AuditRecord>) {
        if !record.severity.alerts() {
            return;
        }

        let callbacks = self.inner.callbacks.load_full();
        if callbacks.is_empty() {
            return;
        }

        let timeout = self.inner.settings.callback_timeout;
        let tasks = self.inner.tasks.clone();
        if record.severity == Severity::Critical {
            dispatch(&tasks, callbacks, record.clone(), timeout).await;
        } else {
            let record = record.clone();
            self.inner.tasks.spawn(async move {
                dispatch(&tasks, callbacks, record, timeout).await;
            });
        }
    }

    /// Most recent matching records, newest first.
    pub async fn search(&self, query: &AuditQuery) -> Vec<Arc<AuditRecord>> {
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let trail = self.inner.trail.read().await;
        trail
            .iter()
            .rev()
            .filter(|record| query.matches(record))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Evict idle anomaly counters. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.inner.detector.sweep(self.inner.clock.now_millis())
    }

    /// Wait for background HIGH-severity dispatches to drain.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// Deliver `record` to every callback concurrently, isolating failures.
///
/// Callbacks run on the logger's tracker, so dropping the returned future
/// stops the wait but never the deliveries already started.
async fn dispatch(
    tasks: &TaskTracker,
    callbacks: Arc<CallbackList>,
    record: Arc<AuditRecord>,
    timeout: Duration,
) -> DeliveryReport {
    let handles: Vec<_> = callbacks
        .iter()
        .map(|callback| {
            let name = callback.name().to_string();
            let callback = callback.clone();
            let record = record.clone();
            let handle = tasks.spawn(async move {
                match tokio::time::timeout(timeout, callback.on_alert(record)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.0),
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                }
            });
            (name, handle)
        })
        .collect();

    let mut report = DeliveryReport::default();
    for (callback, handle) in handles {
        let message = match handle.await {
            Ok(Ok(())) => {
                report.delivered += 1;
                continue;
            }
            Ok(Err(message)) => message,
            Err(join_error) => join_error.to_string(),
        };
        let failure = SecurityError::AuditDeliveryFailure { callback, message };
        warn!(
            target: AUDIT_TARGET,
            record_id = %record.id,
            event = record.event.as_str(),
            error = %failure,
            "Alert delivery failed"
        );
        metrics::record_alert_failure();
        report.failures.push(failure);
    }

    report
}

/// Fields shared by every pipeline-originated event.
pub fn request_context(
    path: &str,
    method: &str,
    correlation_id: &str,
) -> serde_json::Map<String, Value> {
    match json!({
        "path": path,
        "method": method,
        "correlationId": correlation_id,
    }) {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}
