//! Structured observability events.
//!
//! Terminal failures are silent data loss unless surfaced, so the dispatch
//! pipeline emits explicit events at every decision point instead of relying
//! on log lines alone. The sink is a seam: production wires a tracing +
//! metrics implementation, tests assert against [`InMemorySink`].

use std::sync::Mutex;

use serde::Serialize;

use lyceum_core::OutboxId;

/// Lifecycle events emitted by the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// An outbox record was durably created.
    RecordCreated { record_id: OutboxId },

    /// A delivery attempt succeeded; the record is now `Sent`.
    RecordDelivered { record_id: OutboxId, attempt: u32 },

    /// A delivery attempt failed but will be retried after backoff.
    AttemptFailedRetryable {
        record_id: OutboxId,
        attempt: u32,
        error: String,
    },

    /// A record was frozen as failed: retries exhausted or the transport
    /// rejected it permanently. Requires intervention.
    AttemptFailedTerminal {
        record_id: OutboxId,
        attempts: u32,
        error: String,
    },

    /// An unparseable queue message was acknowledged and dropped.
    PoisonMessageDropped { receipt: String, error: String },

    /// A termination signal was observed; intake has stopped.
    ShutdownStarted,

    /// All in-flight deliveries drained before the deadline.
    ShutdownCompleted,

    /// The drain deadline elapsed with deliveries still in flight; their
    /// messages remain unacknowledged for broker redelivery.
    ShutdownDeadlineExceeded { in_flight: usize },
}

/// Sink for dispatch events.
pub trait DispatchSink: Send + Sync {
    fn emit(&self, event: DispatchEvent);
}

/// Sink that drops everything. For wiring paths that don't observe.
#[derive(Debug, Default)]
pub struct NullSink;

impl DispatchSink for NullSink {
    fn emit(&self, _event: DispatchEvent) {}
}

/// Sink that records events for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Count of events matching a predicate.
    pub fn count_where(&self, pred: impl Fn(&DispatchEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl DispatchSink for InMemorySink {
    fn emit(&self, event: DispatchEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_records_in_order() {
        let sink = InMemorySink::new();
        let id = OutboxId::new();

        sink.emit(DispatchEvent::RecordCreated { record_id: id });
        sink.emit(DispatchEvent::ShutdownStarted);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DispatchEvent::RecordCreated { record_id: id });
        assert_eq!(sink.count_where(|e| matches!(e, DispatchEvent::ShutdownStarted)), 1);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&DispatchEvent::ShutdownDeadlineExceeded { in_flight: 2 })
            .unwrap();
        assert!(json.contains("\"event\":\"shutdown_deadline_exceeded\""));
        assert!(json.contains("\"in_flight\":2"));
    }
}
