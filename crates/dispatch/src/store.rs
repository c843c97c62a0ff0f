//! Outbox storage seam.
//!
//! The store is the subsystem's single synchronization point: `mark_sending`
//! must be one atomic conditional update at the storage layer (an
//! `UPDATE … WHERE status = 'pending' …` equivalent), never a read followed
//! by a write in the application. That CAS is what makes at-least-once queue
//! delivery safe — a duplicate wake-up for a record that is already `sending`
//! or `sent` simply loses the swap and is acknowledged as a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use lyceum_core::OutboxId;

use crate::record::{NewOutboxRecord, OutboxRecord};

/// Outbox store error.
#[derive(Debug, Error)]
pub enum OutboxStoreError {
    #[error("outbox record not found: {0}")]
    NotFound(OutboxId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable store of outbox records.
///
/// Records are created by the producer side ([`crate::Dispatcher`]), mutated
/// only by the consumer through the lifecycle methods below, and never
/// deleted by this subsystem (retention is an external concern).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new record in `Pending` state and return it.
    ///
    /// Implementations backed by a transactional database additionally offer
    /// a transaction-scoped variant so the row commits atomically with the
    /// caller's business write; this method is the out-of-band form.
    async fn create(&self, new: NewOutboxRecord) -> Result<OutboxRecord, OutboxStoreError>;

    /// Load a record by id. `Ok(None)` when it does not (or no longer) exist.
    async fn load(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxStoreError>;

    /// Atomically claim the record for a delivery attempt.
    ///
    /// Succeeds only from `Pending` with any backoff window elapsed, and
    /// increments `attempt_count` in the same conditional update. The winner
    /// receives the post-increment count and must use it for the retry
    /// decision; a count read before the claim can be stale by the time the
    /// swap lands. Returns `Ok(None)` when the swap is lost (duplicate
    /// delivery, not yet due, the record is terminal, or it does not exist)
    /// and callers acknowledge and move on.
    async fn mark_sending(&self, id: OutboxId) -> Result<Option<u32>, OutboxStoreError>;

    /// Record a successful delivery (`Sending` → `Sent`, write-once).
    async fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxStoreError>;

    /// Return the record to `Pending` after a retryable failure, recording
    /// the error and the earliest instant of the next attempt.
    async fn mark_failed_retry(
        &self,
        id: OutboxId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Freeze the record as `Failed`; no further retries will happen.
    async fn mark_failed_terminal(&self, id: OutboxId, error: &str)
        -> Result<(), OutboxStoreError>;

    /// Pending records whose next attempt is due at `now`, plus pending
    /// records without a scheduled attempt that have sat untouched for
    /// `stale_after` (their create-time publish never reached the broker).
    /// Feeds the notifier's re-enqueue sweep.
    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<OutboxId>, OutboxStoreError>;
}
