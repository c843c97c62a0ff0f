//! Reliable email dispatch: the transactional-outbox domain.
//!
//! This crate defines the dispatch subsystem's types and trait seams, free of
//! any concrete storage, broker, or mail-transport dependency:
//!
//! - [`record`] — the durable [`OutboxRecord`](record::OutboxRecord) and its
//!   status lifecycle (the single source of truth for "must this email still
//!   be delivered").
//! - [`retry`] — bounded-attempt policy with exponential backoff.
//! - [`attempt`] — the ephemeral per-cycle [`DeliveryAttempt`](attempt::DeliveryAttempt).
//! - [`store`] — the [`OutboxStore`](store::OutboxStore) seam, including the
//!   claim CAS that serializes concurrent consumers.
//! - [`queue`] — the wake-up message and the at-least-once broker seam.
//! - [`mailer`] — the mail-transport seam with the retryable/terminal error split.
//! - [`events`] — structured observability events and their sink.
//! - [`dispatcher`] — the producer half: outbox write plus best-effort publish.
//!
//! Concrete adapters (Postgres, Redis Streams, SMTP, in-memory doubles) live
//! in `lyceum-infra`; the consuming worker lives in `lyceum-notifier`.

pub mod attempt;
pub mod dispatcher;
pub mod events;
pub mod mailer;
pub mod queue;
pub mod record;
pub mod retry;
pub mod store;

pub use attempt::{AttemptOutcome, DeliveryAttempt};
pub use dispatcher::Dispatcher;
pub use events::{DispatchEvent, DispatchSink, InMemorySink, NullSink};
pub use mailer::{DeliveryClient, DeliveryError, DeliveryErrorKind};
pub use queue::{DispatchQueue, QueueDelivery, QueueError, QueueMessage};
pub use record::{DeliveryStatus, NewOutboxRecord, OutboxRecord};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{OutboxStore, OutboxStoreError};
