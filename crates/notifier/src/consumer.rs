//! Per-message processing.
//!
//! One queue delivery is processed end to end: parse, claim, send, record
//! the outcome, acknowledge. The claim is the store's CAS, so a duplicate
//! delivery of an id that is already being (or has been) handled loses the
//! swap and is acknowledged without a send. Acknowledgment is deliberately
//! last: a crash anywhere before it leaves the message pending at the
//! broker, and redelivery plus the CAS gives exactly-one-send in practice
//! on top of at-least-once transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use lyceum_core::OutboxId;
use lyceum_dispatch::attempt::{AttemptOutcome, DeliveryAttempt};
use lyceum_dispatch::events::{DispatchEvent, DispatchSink};
use lyceum_dispatch::mailer::DeliveryClient;
use lyceum_dispatch::queue::{DispatchQueue, QueueDelivery};
use lyceum_dispatch::record::OutboxRecord;
use lyceum_dispatch::retry::RetryPolicy;
use lyceum_dispatch::store::OutboxStore;

/// How a queue delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Email sent; record is `Sent`.
    Delivered,
    /// Retryable failure with attempts left; a new wake-up is due after
    /// `delay`.
    Requeued { record_id: OutboxId, delay: Duration },
    /// Record frozen as `Failed` (retries exhausted or permanent rejection).
    TerminalFailure,
    /// Lost the claim CAS: another consumer owns (or owned) this record, or
    /// its backoff window has not elapsed. Acknowledged without a send.
    Duplicate,
    /// The referenced record does not exist. Acknowledged and dropped.
    NotFound,
    /// Unparseable body. Acknowledged and dropped.
    Poison,
    /// An infrastructure error interrupted processing; the message was
    /// returned to the broker for redelivery.
    Abandoned,
}

pub struct Consumer {
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn DispatchQueue>,
    delivery_client: Arc<dyn DeliveryClient>,
    sink: Arc<dyn DispatchSink>,
    policy: RetryPolicy,
}

impl Consumer {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        queue: Arc<dyn DispatchQueue>,
        delivery_client: Arc<dyn DeliveryClient>,
        sink: Arc<dyn DispatchSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            delivery_client,
            sink,
            policy,
        }
    }

    /// Process one delivery to a final disposition, including its ack/nack.
    #[instrument(skip(self, delivery), fields(receipt = %delivery.receipt))]
    pub async fn process_delivery(&self, delivery: &QueueDelivery) -> MessageDisposition {
        let message = match delivery.message() {
            Ok(message) => message,
            Err(e) => {
                // Redelivering an unparseable body can only fail again, so
                // drop it and make the drop loud.
                warn!(error = %e, "dropping poison message");
                self.sink.emit(DispatchEvent::PoisonMessageDropped {
                    receipt: delivery.receipt.clone(),
                    error: e.to_string(),
                });
                self.ack(delivery).await;
                return MessageDisposition::Poison;
            }
        };

        let id = message.outbox_id;
        let record = match self.store.load(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(outbox_id = %id, "wake-up references a missing record");
                self.ack(delivery).await;
                return MessageDisposition::NotFound;
            }
            Err(e) => {
                error!(outbox_id = %id, error = %e, "store load failed, returning message");
                self.abandon(delivery).await;
                return MessageDisposition::Abandoned;
            }
        };

        // The attempt number comes from the CAS itself, not from the record
        // loaded above: another consumer may have run a full attempt between
        // our load and our claim, and a stale number would grant it an extra
        // retry.
        let attempt_number = match self.store.mark_sending(id).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                debug!(outbox_id = %id, status = %record.status, "lost claim, acknowledging");
                self.ack(delivery).await;
                return MessageDisposition::Duplicate;
            }
            Err(e) => {
                error!(outbox_id = %id, error = %e, "claim failed, returning message");
                self.abandon(delivery).await;
                return MessageDisposition::Abandoned;
            }
        };

        let attempt = self.attempt_delivery(&record, attempt_number).await;
        let disposition = self.record_outcome(attempt).await;
        self.ack(delivery).await;
        disposition
    }

    /// Perform the send and summarize it, without touching the store.
    async fn attempt_delivery(&self, record: &OutboxRecord, attempt_number: u32) -> DeliveryAttempt {
        let result = self
            .delivery_client
            .send(&record.recipients, &record.subject, &record.body)
            .await;

        match result {
            Ok(()) => DeliveryAttempt::success(record.id, attempt_number),
            Err(e) if e.is_retryable() => {
                DeliveryAttempt::retryable(record.id, attempt_number, e.to_string())
            }
            Err(e) => DeliveryAttempt::terminal(record.id, attempt_number, e.to_string()),
        }
    }

    /// Persist the attempt's consequence and emit its event.
    async fn record_outcome(&self, attempt: DeliveryAttempt) -> MessageDisposition {
        let id = attempt.record_id;
        let number = attempt.attempt_number;
        let error_detail = attempt.error_detail.unwrap_or_default();

        match attempt.outcome {
            AttemptOutcome::Success => {
                if let Err(e) = self.store.mark_sent(id).await {
                    // The email left; failing here means one extra send after
                    // redelivery at worst.
                    error!(outbox_id = %id, error = %e, "delivered but mark_sent failed");
                }
                self.sink.emit(DispatchEvent::RecordDelivered {
                    record_id: id,
                    attempt: number,
                });
                MessageDisposition::Delivered
            }
            AttemptOutcome::RetryableFailure if self.policy.should_retry(number) => {
                let delay = self.policy.delay_for_attempt(number);
                let next_attempt_at = self.policy.next_attempt_at(number, Utc::now());
                if let Err(e) = self
                    .store
                    .mark_failed_retry(id, &error_detail, next_attempt_at)
                    .await
                {
                    error!(outbox_id = %id, error = %e, "mark_failed_retry failed");
                }
                self.sink.emit(DispatchEvent::AttemptFailedRetryable {
                    record_id: id,
                    attempt: number,
                    error: error_detail,
                });
                MessageDisposition::Requeued {
                    record_id: id,
                    delay,
                }
            }
            AttemptOutcome::RetryableFailure | AttemptOutcome::TerminalFailure => {
                let error = if attempt.outcome == AttemptOutcome::RetryableFailure {
                    format!("retries exhausted after {number} attempts: {error_detail}")
                } else {
                    error_detail
                };
                if let Err(e) = self.store.mark_failed_terminal(id, &error).await {
                    error!(outbox_id = %id, error = %e, "mark_failed_terminal failed");
                }
                self.sink.emit(DispatchEvent::AttemptFailedTerminal {
                    record_id: id,
                    attempts: number,
                    error,
                });
                MessageDisposition::TerminalFailure
            }
        }
    }

    async fn ack(&self, delivery: &QueueDelivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            // The broker will redeliver; the claim CAS absorbs the duplicate.
            warn!(receipt = %delivery.receipt, error = %e, "ack failed");
        }
    }

    async fn abandon(&self, delivery: &QueueDelivery) {
        if let Err(e) = self.queue.nack(delivery, true).await {
            warn!(receipt = %delivery.receipt, error = %e, "nack failed");
        }
    }
}
