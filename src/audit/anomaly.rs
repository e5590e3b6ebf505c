//! Per-actor burst detection over a sliding one-hour window.

use std::collections::VecDeque;

use dashmap::DashMap;

use super::event::AuditEventType;

/// Length of the counting window.
pub const ANOMALY_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Events per actor per hour above which activity is flagged.
pub fn threshold(event: AuditEventType) -> Option<usize> {
    match event {
        AuditEventType::LoginFailure => Some(5),
        AuditEventType::RateLimitExceeded => Some(10),
        AuditEventType::PostCreate => Some(50),
        AuditEventType::PostDelete => Some(20),
        _ => None,
    }
}

/// A threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anomaly {
    pub event: AuditEventType,
    pub count: usize,
    pub threshold: usize,
}

/// Per-(event, actor) timestamps inside the window.
///
/// At most `threshold + 1` timestamps are kept per key: that is enough to
/// tell whether the actor is over the threshold, and it bounds memory by the
/// number of actors rather than the number of events.
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    seen: DashMap<(AuditEventType, String), VecDeque<u64>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence and report when it pushes the actor over the threshold.
    ///
    /// Reports once per crossing. The actor has to drop back under the
    /// threshold before it is reported again.
    pub fn observe(&self, event: AuditEventType, actor_key: &str, now: u64) -> Option<Anomaly> {
        let threshold = threshold(event)?;
        let mut entry = self.seen.entry((event, actor_key.to_string())).or_default();
        let timestamps = entry.value_mut();

        let cutoff = now.saturating_sub(ANOMALY_WINDOW_MS);
        while timestamps.front().is_some_and(|&t| t <= cutoff) {
            timestamps.pop_front();
        }
        let before = timestamps.len();
        timestamps.push_back(now);
        if timestamps.len() > threshold + 1 {
            timestamps.pop_front();
        }

        (before == threshold).then_some(Anomaly {
            event,
            count: threshold + 1,
            threshold,
        })
    }

    /// Drop actors with no activity inside the window.
    pub fn sweep(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(ANOMALY_WINDOW_MS);
        let before = self.seen.len();
        self.seen
            .retain(|_, timestamps| timestamps.back().is_some_and(|&t| t > cutoff));
        before.saturating_sub(self.seen.len())
    }
}
