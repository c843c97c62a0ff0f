//! Production event sink: structured logs plus counters.

use std::sync::Arc;

use tracing::{error, info, warn};

use lyceum_dispatch::events::{DispatchEvent, DispatchSink};
use lyceum_observability::DispatchMetrics;

pub struct TracingSink {
    metrics: Arc<DispatchMetrics>,
}

impl TracingSink {
    pub fn new(metrics: Arc<DispatchMetrics>) -> Self {
        Self { metrics }
    }
}

impl DispatchSink for TracingSink {
    fn emit(&self, event: DispatchEvent) {
        match &event {
            DispatchEvent::RecordCreated { record_id } => {
                info!(outbox_id = %record_id, "outbox record created");
            }
            DispatchEvent::RecordDelivered { record_id, attempt } => {
                self.metrics.record_sent();
                info!(outbox_id = %record_id, attempt, "email delivered");
            }
            DispatchEvent::AttemptFailedRetryable {
                record_id,
                attempt,
                error,
            } => {
                self.metrics.record_retry_scheduled();
                warn!(outbox_id = %record_id, attempt, error, "delivery failed, retry scheduled");
            }
            DispatchEvent::AttemptFailedTerminal {
                record_id,
                attempts,
                error,
            } => {
                self.metrics.record_terminal_failure();
                error!(outbox_id = %record_id, attempts, error, "delivery failed terminally");
            }
            DispatchEvent::PoisonMessageDropped { receipt, error } => {
                self.metrics.record_poison_dropped();
                error!(receipt, error, "poison message dropped");
            }
            DispatchEvent::ShutdownStarted => info!("shutdown started"),
            DispatchEvent::ShutdownCompleted => info!("shutdown completed cleanly"),
            DispatchEvent::ShutdownDeadlineExceeded { in_flight } => {
                warn!(in_flight, "shutdown deadline exceeded");
            }
        }
    }
}
