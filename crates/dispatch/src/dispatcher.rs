//! Producer half of the outbox: durable write, then best-effort wake-up.
//!
//! The outbox row, not the queue, is the durability boundary. `enqueue_email`
//! therefore treats a publish failure as a logged non-event: the record stays
//! `Pending` and the notifier's sweep re-publishes it once it turns stale.
//! Callers that need the row to commit atomically with their own business
//! write use the store's transaction-scoped create and publish afterwards.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{DispatchEvent, DispatchSink};
use crate::queue::{DispatchQueue, QueueMessage};
use crate::record::{NewOutboxRecord, OutboxRecord};
use crate::store::{OutboxStore, OutboxStoreError};

/// Writes outbox records and nudges the queue.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn DispatchQueue>,
    sink: Arc<dyn DispatchSink>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        queue: Arc<dyn DispatchQueue>,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        Self { store, queue, sink }
    }

    /// Durably record an email obligation, then publish its wake-up message.
    ///
    /// Returns the created record. Only the store write can fail; broker
    /// unavailability degrades to a delayed delivery, not an error.
    pub async fn enqueue_email(
        &self,
        new: NewOutboxRecord,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        let record = self.store.create(new).await?;
        self.sink.emit(DispatchEvent::RecordCreated { record_id: record.id });
        debug!(outbox_id = %record.id, recipients = record.recipients.len(), "outbox record created");

        self.publish_wakeup(&record).await;
        Ok(record)
    }

    /// Publish the wake-up for an already-committed record (used after a
    /// transaction-scoped create, and by the re-enqueue sweep).
    pub async fn publish_wakeup(&self, record: &OutboxRecord) {
        let message = QueueMessage::new(record.id);
        if let Err(e) = self.queue.publish(&message).await {
            warn!(outbox_id = %record.id, error = %e, "wake-up publish failed; record stays pending for the sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use lyceum_core::{EmailAddress, MessageId, OutboxId};

    use crate::events::InMemorySink;
    use crate::queue::{QueueDelivery, QueueError};

    /// Store stub: remembers creates, no lifecycle.
    #[derive(Default)]
    struct RecordingStore {
        created: Mutex<Vec<OutboxRecord>>,
    }

    #[async_trait]
    impl OutboxStore for RecordingStore {
        async fn create(&self, new: NewOutboxRecord) -> Result<OutboxRecord, OutboxStoreError> {
            let record = OutboxRecord::create(new, Utc::now());
            self.created.lock().unwrap().push(record.clone());
            Ok(record)
        }

        async fn load(&self, _id: OutboxId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
            Ok(None)
        }

        async fn mark_sending(&self, _id: OutboxId) -> Result<Option<u32>, OutboxStoreError> {
            Ok(None)
        }

        async fn mark_sent(&self, _id: OutboxId) -> Result<(), OutboxStoreError> {
            Ok(())
        }

        async fn mark_failed_retry(
            &self,
            _id: OutboxId,
            _error: &str,
            _next_attempt_at: DateTime<Utc>,
        ) -> Result<(), OutboxStoreError> {
            Ok(())
        }

        async fn mark_failed_terminal(
            &self,
            _id: OutboxId,
            _error: &str,
        ) -> Result<(), OutboxStoreError> {
            Ok(())
        }

        async fn due_for_retry(
            &self,
            _now: DateTime<Utc>,
            _stale_after: chrono::Duration,
            _limit: usize,
        ) -> Result<Vec<OutboxId>, OutboxStoreError> {
            Ok(vec![])
        }
    }

    /// Queue stub: counts publishes, optionally failing them all.
    #[derive(Default)]
    struct RecordingQueue {
        published: Mutex<Vec<QueueMessage>>,
        broken: bool,
    }

    #[async_trait]
    impl DispatchQueue for RecordingQueue {
        async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
            if self.broken {
                return Err(QueueError::Connection("broker unreachable".into()));
            }
            self.published.lock().unwrap().push(*message);
            Ok(())
        }

        async fn receive(&self, _wait: Duration) -> Result<Option<QueueDelivery>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &QueueDelivery) -> Result<(), QueueError> {
            Ok(())
        }

        async fn nack(&self, _delivery: &QueueDelivery, _requeue: bool) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn payload() -> NewOutboxRecord {
        NewOutboxRecord::new(
            MessageId::new(),
            vec![EmailAddress::parse("parent@school.example").unwrap()],
            "Schedule change",
            "Tomorrow's math lesson moves to room 204.",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_writes_then_publishes() {
        let store = Arc::new(RecordingStore::default());
        let queue = Arc::new(RecordingQueue::default());
        let sink = Arc::new(InMemorySink::new());
        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), sink.clone());

        let record = dispatcher.enqueue_email(payload()).await.unwrap();

        assert_eq!(store.created.lock().unwrap().len(), 1);
        let published = queue.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].outbox_id, record.id);
        assert_eq!(
            sink.count_where(|e| matches!(e, DispatchEvent::RecordCreated { .. })),
            1
        );
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_the_caller() {
        let store = Arc::new(RecordingStore::default());
        let queue = Arc::new(RecordingQueue { broken: true, ..Default::default() });
        let sink = Arc::new(InMemorySink::new());
        let dispatcher = Dispatcher::new(store.clone(), queue, sink);

        let record = dispatcher.enqueue_email(payload()).await.unwrap();

        // The durable write happened; the wake-up is the sweep's problem now.
        assert_eq!(store.created.lock().unwrap()[0].id, record.id);
        assert_eq!(record.status, crate::record::DeliveryStatus::Pending);
    }
}
