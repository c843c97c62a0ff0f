//! Wake-up messages and the broker seam.
//!
//! The queue carries only record ids — the outbox row is the durable truth,
//! so duplicating payload onto the wire would create a second source of it.
//! Brokers are assumed to deliver **at least once** with manual
//! acknowledgment; consumers must be idempotent against duplicate ids, which
//! the store's claim CAS provides.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lyceum_core::OutboxId;

/// The wire payload: a wake-up signal referencing one outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub outbox_id: OutboxId,
}

impl QueueMessage {
    pub fn new(outbox_id: OutboxId) -> Self {
        Self { outbox_id }
    }

    /// Serialize to the wire form (`{"outbox_id": "…"}`).
    pub fn encode(&self) -> String {
        // A struct of one Copy field cannot fail to serialize.
        serde_json::to_string(self).expect("queue message serialization")
    }
}

/// A message as received from the broker: the raw body plus the receipt
/// handle needed to ack or nack it.
///
/// The body is kept raw so unparseable (poison) payloads reach the consumer,
/// which owns the drop-and-acknowledge policy for them.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    /// Broker-assigned receipt (e.g. a stream entry id).
    pub receipt: String,
    pub body: String,
}

impl QueueDelivery {
    /// Parse the body into a [`QueueMessage`].
    pub fn message(&self) -> Result<QueueMessage, QueueError> {
        serde_json::from_str(&self.body)
            .map_err(|e| QueueError::Malformed(format!("{e} (body: {:?})", self.body)))
    }
}

/// Broker error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("malformed queue message: {0}")]
    Malformed(String),

    #[error("queue is closed")]
    Closed,
}

/// Durable queue with at-least-once delivery and manual acknowledgment.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Enqueue a wake-up message. Best-effort from the producer's view:
    /// a failure here leaves the outbox record `Pending` for the sweep.
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next delivery. `Ok(None)` on timeout.
    ///
    /// An unacknowledged delivery is eventually redelivered (possibly to
    /// another consumer instance), which is what preserves at-least-once
    /// semantics across crashes and forced shutdowns.
    async fn receive(&self, wait: Duration) -> Result<Option<QueueDelivery>, QueueError>;

    /// Acknowledge a delivery; the broker will not deliver it again.
    async fn ack(&self, delivery: &QueueDelivery) -> Result<(), QueueError>;

    /// Reject a delivery. With `requeue` it becomes immediately eligible for
    /// redelivery; without, it is dropped.
    async fn nack(&self, delivery: &QueueDelivery, requeue: bool) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_round_trip() {
        let msg = QueueMessage::new(OutboxId::new());
        let body = msg.encode();
        assert!(body.starts_with("{\"outbox_id\":"));

        let delivery = QueueDelivery {
            receipt: "1-0".to_string(),
            body,
        };
        assert_eq!(delivery.message().unwrap(), msg);
    }

    #[test]
    fn malformed_bodies_surface_as_malformed() {
        for body in ["", "{}", "{\"outbox_id\": 7}", "not json"] {
            let delivery = QueueDelivery {
                receipt: "1-0".to_string(),
                body: body.to_string(),
            };
            assert!(
                matches!(delivery.message(), Err(QueueError::Malformed(_))),
                "{body:?} should be malformed"
            );
        }
    }
}
