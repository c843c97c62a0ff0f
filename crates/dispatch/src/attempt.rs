//! Ephemeral record of one delivery attempt.

use lyceum_core::OutboxId;

/// How a single delivery attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One consumption cycle's view of a delivery attempt.
///
/// Exists only in memory for the duration of the cycle; it drives the retry
/// decision and the observability event, then is dropped. Durable attempt
/// accounting lives on the outbox record itself.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub record_id: OutboxId,
    /// 1-indexed attempt number (mirrors the record's `attempt_count` at the
    /// time the attempt was claimed).
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

impl DeliveryAttempt {
    pub fn success(record_id: OutboxId, attempt_number: u32) -> Self {
        Self {
            record_id,
            attempt_number,
            outcome: AttemptOutcome::Success,
            error_detail: None,
        }
    }

    pub fn retryable(record_id: OutboxId, attempt_number: u32, error: impl Into<String>) -> Self {
        Self {
            record_id,
            attempt_number,
            outcome: AttemptOutcome::RetryableFailure,
            error_detail: Some(error.into()),
        }
    }

    pub fn terminal(record_id: OutboxId, attempt_number: u32, error: impl Into<String>) -> Self {
        Self {
            record_id,
            attempt_number,
            outcome: AttemptOutcome::TerminalFailure,
            error_detail: Some(error.into()),
        }
    }
}
