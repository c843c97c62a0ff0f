//! The durable outbox record and its status lifecycle.
//!
//! An outbox row is written in the same transaction as the business change
//! that caused it, so no notification is ever lost to a crash between "event
//! happened" and "worker was told". The row is the durable truth; queue
//! messages merely wake a consumer up.
//!
//! ## Status lifecycle
//!
//! ```text
//! Pending ──claim──▶ Sending ──success──▶ Sent        (never mutated again)
//!    ▲                  │
//!    └──retryable───────┼──terminal──▶ Failed         (no further retries)
//!       (backoff)
//! ```
//!
//! Transitions are driven exclusively through [`crate::store::OutboxStore`];
//! the mutators here exist so every store implementation applies identical
//! rules. A record never regresses from `Sent`, and a `Pending` record whose
//! backoff window has not elapsed cannot be claimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lyceum_core::{DomainError, DomainResult, EmailAddress, MessageId, OutboxId};

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting to be claimed (initially, or between retry attempts).
    Pending,
    /// Claimed by a consumer; a delivery attempt is in flight.
    Sending,
    /// Delivered. Terminal; the record is never mutated again.
    Sent,
    /// Retries exhausted or a terminal transport error. Requires human
    /// or downstream intervention.
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sending" => Ok(DeliveryStatus::Sending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown delivery status: {other:?}"
            ))),
        }
    }
}

/// Payload for a record that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub message_id: MessageId,
    pub recipients: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
}

impl NewOutboxRecord {
    /// Validate the payload. At least one recipient is required; an email
    /// with nobody to send it to is a caller bug, not a delivery failure.
    pub fn new(
        message_id: MessageId,
        recipients: Vec<EmailAddress>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> DomainResult<Self> {
        if recipients.is_empty() {
            return Err(DomainError::validation("outbox record needs at least one recipient"));
        }
        Ok(Self {
            message_id,
            recipients,
            subject: subject.into(),
            body: body.into(),
        })
    }
}

/// A durable email-delivery obligation.
///
/// `id`, `message_id` and the payload fields are immutable once created.
/// Everything else is mutated only through the lifecycle methods below (and
/// thus only by the store that owns the record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    /// The domain message that triggered this email (traceability only).
    pub message_id: MessageId,
    pub recipients: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
    pub status: DeliveryStatus,
    /// Delivery attempts started so far. Persisted, so a process restart
    /// never grants extra attempts.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Earliest instant the next attempt may be claimed. `None` means
    /// "immediately" (first attempt, or a record awaiting its first publish).
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Materialize a new record in its initial state.
    pub fn create(new: NewOutboxRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: OutboxId::new(),
            message_id: new.message_id,
            recipients: new.recipients,
            subject: new.subject,
            body: new.body,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            next_attempt_at: None,
        }
    }

    /// Whether the record may be claimed at `now` (pending and past any
    /// backoff window).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Claim the record for a delivery attempt.
    ///
    /// This is the in-memory form of the storage-layer CAS: it succeeds only
    /// from a claimable `Pending` state and increments `attempt_count` as a
    /// side effect, so the counter reflects attempts *started*. The winner
    /// gets the post-increment count back and must key its retry decision
    /// off that value, not any snapshot read before the claim. Returns
    /// `None` (leaving the record untouched) for duplicates and not-yet-due
    /// retries.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Option<u32> {
        if !self.is_claimable(now) {
            return None;
        }
        self.status = DeliveryStatus::Sending;
        self.attempt_count += 1;
        self.updated_at = now;
        Some(self.attempt_count)
    }

    /// Record a successful delivery. Only valid from `Sending`; a `Sent`
    /// record is write-once.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != DeliveryStatus::Sending {
            return false;
        }
        self.status = DeliveryStatus::Sent;
        self.sent_at = Some(now);
        self.last_error = None;
        self.updated_at = now;
        true
    }

    /// Return the record to `Pending` with a backoff deadline after a
    /// retryable failure.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != DeliveryStatus::Sending {
            return false;
        }
        self.status = DeliveryStatus::Pending;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
        true
    }

    /// Freeze the record as `Failed`. Valid from any non-`Sent` state: a
    /// terminal classification must stick even if the row was concurrently
    /// returned to `Pending`.
    pub fn fail_terminal(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status == DeliveryStatus::Sent {
            return false;
        }
        self.status = DeliveryStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
        true
    }
}
