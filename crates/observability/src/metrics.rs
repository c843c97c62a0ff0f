//! Atomic counters for the dispatch pipeline.
//!
//! A terminal delivery failure that only ever appears as a log line is silent
//! data loss waiting to be missed; these counters give alerting something to
//! key on. Exporters can poll [`DispatchMetrics::snapshot`] and ship it
//! wherever they like.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide dispatch counters. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    sent: AtomicU64,
    retries_scheduled: AtomicU64,
    failed_terminal: AtomicU64,
    poison_dropped: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal_failure(&self) {
        self.failed_terminal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poison_dropped(&self) {
        self.poison_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            failed_terminal: self.failed_terminal.load(Ordering::Relaxed),
            poison_dropped: self.poison_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub retries_scheduled: u64,
    pub failed_terminal: u64,
    pub poison_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = DispatchMetrics::new();
        metrics.record_sent();
        metrics.record_sent();
        metrics.record_terminal_failure();
        metrics.record_poison_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.sent, 2);
        assert_eq!(snap.retries_scheduled, 0);
        assert_eq!(snap.failed_terminal, 1);
        assert_eq!(snap.poison_dropped, 1);
    }
}
