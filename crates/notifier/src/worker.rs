//! The notifier run loop.
//!
//! Pulls wake-up messages off the queue and fans them out to
//! [`Consumer::process_delivery`] under a concurrency cap. Retries never
//! block a worker: a retryable failure schedules a timer task that
//! re-publishes the wake-up after the backoff window, and a periodic sweep
//! re-publishes due records whose timer (or create-time publish) was lost
//! to a crash or broker outage.
//!
//! On shutdown the loop stops taking messages immediately, then drains
//! in-flight deliveries up to a deadline. A clean drain acks everything; a
//! forced exit leaves unfinished messages unacknowledged so the broker
//! redelivers them to the next instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use lyceum_dispatch::events::{DispatchEvent, DispatchSink};
use lyceum_dispatch::queue::{DispatchQueue, QueueError, QueueMessage};
use lyceum_dispatch::store::OutboxStore;

use crate::consumer::{Consumer, MessageDisposition};
use crate::shutdown::ShutdownCoordinator;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight delivery finished before the deadline.
    Clean,
    /// The deadline elapsed with deliveries still in flight; their messages
    /// stay unacknowledged for redelivery.
    Forced { in_flight: usize },
}

impl DrainOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, DrainOutcome::Clean)
    }

    /// Process exit code for this outcome: 0 for a clean drain, 1 when the
    /// deadline forced the exit. Supervisors key restarts and alerts off
    /// this.
    pub fn exit_code(&self) -> u8 {
        match self {
            DrainOutcome::Clean => 0,
            DrainOutcome::Forced { .. } => 1,
        }
    }
}

/// Tunables for one notifier instance.
#[derive(Debug, Clone)]
pub struct NotifierSettings {
    /// Concurrent in-flight deliveries.
    pub concurrency: usize,
    /// Drain budget after a termination signal.
    pub shutdown_deadline: Duration,
    /// Blocking-receive window per poll.
    pub receive_wait: Duration,
    /// Period of the due-retry sweep.
    pub sweep_interval: Duration,
    /// Pending records with no scheduled attempt are re-published once they
    /// have sat untouched this long.
    pub sweep_stale_after: Duration,
    /// Records re-published per sweep.
    pub sweep_batch: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            shutdown_deadline: Duration::from_secs(30),
            receive_wait: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
            sweep_stale_after: Duration::from_secs(300),
            sweep_batch: 100,
        }
    }
}

pub struct Notifier {
    consumer: Arc<Consumer>,
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn DispatchQueue>,
    sink: Arc<dyn DispatchSink>,
    coordinator: Arc<ShutdownCoordinator>,
    settings: NotifierSettings,
}

impl Notifier {
    pub fn new(
        consumer: Consumer,
        store: Arc<dyn OutboxStore>,
        queue: Arc<dyn DispatchQueue>,
        sink: Arc<dyn DispatchSink>,
        coordinator: Arc<ShutdownCoordinator>,
        settings: NotifierSettings,
    ) -> Self {
        Self {
            consumer: Arc::new(consumer),
            store,
            queue,
            sink,
            coordinator,
            settings,
        }
    }

    /// Run until shutdown is triggered, then drain and report the outcome.
    #[instrument(skip(self))]
    pub async fn run(&self) -> DrainOutcome {
        let sweep = tokio::spawn(sweep_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.coordinator),
            self.settings.sweep_interval,
            self.settings.sweep_stale_after,
            self.settings.sweep_batch,
        ));

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        info!(concurrency = self.settings.concurrency, "notifier started");

        while !self.coordinator.is_stopping() {
            // Hold a permit before receiving so the queue is never read
            // faster than deliveries can be processed.
            let permit = tokio::select! {
                _ = self.coordinator.stopped() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = self.coordinator.stopped() => break,
                received = self.queue.receive(self.settings.receive_wait) => received,
            };
            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(QueueError::Closed) => {
                    warn!("queue closed, stopping intake");
                    self.coordinator.trigger();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "receive failed, backing off");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };

            // The guard spans processing *and* the final ack, so a drain
            // only succeeds once every outcome is durably recorded.
            let guard = self.coordinator.track();
            let consumer = Arc::clone(&self.consumer);
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                let disposition = consumer.process_delivery(&delivery).await;
                if let MessageDisposition::Requeued { record_id, delay } = disposition {
                    // Timer tasks die with the process; the sweep (or the
                    // next instance's sweep) re-publishes what they miss.
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = queue.publish(&QueueMessage::new(record_id)).await {
                            warn!(outbox_id = %record_id, error = %e, "retry re-publish failed");
                        }
                    });
                }
                drop(guard);
                drop(permit);
            });
        }

        info!(
            in_flight = self.coordinator.in_flight(),
            deadline = ?self.settings.shutdown_deadline,
            "shutdown started, draining"
        );
        self.sink.emit(DispatchEvent::ShutdownStarted);
        sweep.abort();

        if self.coordinator.drain(self.settings.shutdown_deadline).await {
            info!("drain complete");
            self.sink.emit(DispatchEvent::ShutdownCompleted);
            DrainOutcome::Clean
        } else {
            let in_flight = self.coordinator.in_flight();
            warn!(in_flight, "drain deadline exceeded, forcing exit");
            self.sink
                .emit(DispatchEvent::ShutdownDeadlineExceeded { in_flight });
            DrainOutcome::Forced { in_flight }
        }
    }
}

/// Periodically re-publish wake-ups for records that are due.
async fn sweep_loop(
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn DispatchQueue>,
    coordinator: Arc<ShutdownCoordinator>,
    interval: Duration,
    stale_after: Duration,
    batch: usize,
) {
    let stale_after = chrono::Duration::from_std(stale_after)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    loop {
        tokio::select! {
            _ = coordinator.stopped() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let due = match store.due_for_retry(Utc::now(), stale_after, batch).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "due-retry sweep query failed");
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }

        info!(count = due.len(), "sweep re-publishing due records");
        for id in due {
            if let Err(e) = queue.publish(&QueueMessage::new(id)).await {
                warn!(outbox_id = %id, error = %e, "sweep re-publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lyceum_core::{EmailAddress, MessageId, OutboxId};
    use lyceum_dispatch::Dispatcher;
    use lyceum_dispatch::events::InMemorySink;
    use lyceum_dispatch::record::{DeliveryStatus, NewOutboxRecord};
    use lyceum_dispatch::retry::RetryPolicy;
    use lyceum_infra::mailer::fake::{FakeDeliveryClient, ScriptedOutcome};
    use lyceum_infra::{InMemoryOutboxStore, InMemoryQueue};

    struct Fixture {
        store: Arc<InMemoryOutboxStore>,
        queue: Arc<InMemoryQueue>,
        client: Arc<FakeDeliveryClient>,
        sink: Arc<InMemorySink>,
        coordinator: Arc<ShutdownCoordinator>,
        notifier: Arc<Notifier>,
    }

    fn fixture(client: FakeDeliveryClient, settings: NotifierSettings) -> Fixture {
        let store = Arc::new(InMemoryOutboxStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let client = Arc::new(client);
        let sink = Arc::new(InMemorySink::new());
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let consumer = Consumer::new(
            store.clone(),
            queue.clone(),
            client.clone(),
            sink.clone(),
            RetryPolicy::exponential(3, Duration::from_millis(10), Duration::from_secs(60)),
        );
        let notifier = Arc::new(Notifier::new(
            consumer,
            store.clone(),
            queue.clone(),
            sink.clone(),
            coordinator.clone(),
            settings,
        ));
        Fixture {
            store,
            queue,
            client,
            sink,
            coordinator,
            notifier,
        }
    }

    fn test_settings() -> NotifierSettings {
        NotifierSettings {
            concurrency: 4,
            shutdown_deadline: Duration::from_secs(5),
            receive_wait: Duration::from_millis(20),
            sweep_interval: Duration::from_secs(60),
            sweep_stale_after: Duration::from_secs(300),
            sweep_batch: 100,
        }
    }

    fn new_record() -> NewOutboxRecord {
        NewOutboxRecord::new(
            MessageId::new(),
            vec![EmailAddress::parse("registrar@school.example").unwrap()],
            "Enrollment confirmed",
            "Welcome aboard.",
        )
        .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    async fn status_of(store: &InMemoryOutboxStore, id: OutboxId) -> DeliveryStatus {
        store.load(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn delivers_dispatched_records_end_to_end() {
        let f = fixture(FakeDeliveryClient::new(), test_settings());
        let dispatcher = Dispatcher::new(f.store.clone(), f.queue.clone(), f.sink.clone());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(dispatcher.enqueue_email(new_record()).await.unwrap().id);
        }

        let run = tokio::spawn({
            let notifier = f.notifier.clone();
            async move { notifier.run().await }
        });

        let client = f.client.clone();
        wait_for(move || client.delivered_count() == 3).await;
        f.coordinator.trigger();
        assert_eq!(run.await.unwrap(), DrainOutcome::Clean);

        for id in ids {
            assert_eq!(status_of(&f.store, id).await, DeliveryStatus::Sent);
        }
        assert_eq!(f.queue.unacked_count(), 0);
        assert_eq!(
            f.sink.count_where(|e| matches!(e, DispatchEvent::ShutdownCompleted)),
            1
        );
    }

    #[tokio::test]
    async fn retry_timer_republishes_and_second_attempt_succeeds() {
        let f = fixture(
            FakeDeliveryClient::script([ScriptedOutcome::FailRetryable("451 busy".into())]),
            test_settings(),
        );
        let dispatcher = Dispatcher::new(f.store.clone(), f.queue.clone(), f.sink.clone());
        let id = dispatcher.enqueue_email(new_record()).await.unwrap().id;

        let run = tokio::spawn({
            let notifier = f.notifier.clone();
            async move { notifier.run().await }
        });

        let client = f.client.clone();
        wait_for(move || client.delivered_count() == 1).await;
        f.coordinator.trigger();
        assert_eq!(run.await.unwrap(), DrainOutcome::Clean);

        let record = f.store.load(id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(
            f.sink.count_where(|e| matches!(e, DispatchEvent::AttemptFailedRetryable { .. })),
            1
        );
    }

    #[tokio::test]
    async fn sweep_recovers_records_whose_wakeup_was_lost() {
        let mut settings = test_settings();
        settings.sweep_interval = Duration::from_millis(20);
        settings.sweep_stale_after = Duration::ZERO;
        let f = fixture(FakeDeliveryClient::new(), settings);

        // Created directly in the store: the create-time publish never
        // happened, as after a crash between commit and XADD.
        let record = f.store.create(new_record()).await.unwrap();

        let run = tokio::spawn({
            let notifier = f.notifier.clone();
            async move { notifier.run().await }
        });

        let client = f.client.clone();
        wait_for(move || client.delivered_count() == 1).await;
        f.coordinator.trigger();
        assert_eq!(run.await.unwrap(), DrainOutcome::Clean);
        assert_eq!(status_of(&f.store, record.id).await, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn shutdown_waits_for_slow_in_flight_delivery() {
        let f = fixture(
            FakeDeliveryClient::script([ScriptedOutcome::HangFor(Duration::from_millis(80))]),
            test_settings(),
        );
        let dispatcher = Dispatcher::new(f.store.clone(), f.queue.clone(), f.sink.clone());
        let id = dispatcher.enqueue_email(new_record()).await.unwrap().id;

        let run = tokio::spawn({
            let notifier = f.notifier.clone();
            async move { notifier.run().await }
        });

        // Trigger while the send is still hanging.
        let coordinator = f.coordinator.clone();
        wait_for(move || coordinator.in_flight() == 1).await;
        f.coordinator.trigger();

        assert_eq!(run.await.unwrap(), DrainOutcome::Clean);
        assert_eq!(status_of(&f.store, id).await, DeliveryStatus::Sent);
        assert_eq!(f.queue.unacked_count(), 0);
    }

    #[tokio::test]
    async fn forced_shutdown_leaves_message_unacknowledged() {
        let mut settings = test_settings();
        settings.shutdown_deadline = Duration::from_millis(50);
        let f = fixture(
            FakeDeliveryClient::script([ScriptedOutcome::HangForever]),
            settings,
        );
        let dispatcher = Dispatcher::new(f.store.clone(), f.queue.clone(), f.sink.clone());
        let id = dispatcher.enqueue_email(new_record()).await.unwrap().id;

        let run = tokio::spawn({
            let notifier = f.notifier.clone();
            async move { notifier.run().await }
        });

        let coordinator = f.coordinator.clone();
        wait_for(move || coordinator.in_flight() == 1).await;
        f.coordinator.trigger();

        assert_eq!(run.await.unwrap(), DrainOutcome::Forced { in_flight: 1 });
        // Unacked, so a broker would redeliver to the next instance.
        assert_eq!(f.queue.unacked_count(), 1);
        assert_eq!(status_of(&f.store, id).await, DeliveryStatus::Sending);
        assert_eq!(
            f.sink.count_where(|e| matches!(
                e,
                DispatchEvent::ShutdownDeadlineExceeded { in_flight: 1 }
            )),
            1
        );
    }

    #[test]
    fn exit_codes_distinguish_clean_from_forced_shutdown() {
        assert_eq!(DrainOutcome::Clean.exit_code(), 0);
        assert_eq!(DrainOutcome::Forced { in_flight: 1 }.exit_code(), 1);
        assert_eq!(DrainOutcome::Forced { in_flight: 7 }.exit_code(), 1);
    }
}
