//! Mail-transport seam.
//!
//! The crux of the failure model is the retryable/terminal split:
//! classifying a permanent rejection as retryable wastes attempts and delays
//! surfacing, while classifying a transient hiccup as terminal drops a
//! deliverable message. Transport adapters own the mapping from their
//! protocol errors into [`DeliveryError`]; everything downstream (retry
//! accounting, backoff, terminal freezing) keys off `kind` alone.

use async_trait::async_trait;
use thiserror::Error;

use lyceum_core::EmailAddress;

/// Whether a failed delivery may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    /// Connection failures, timeouts, transient SMTP 4xx responses.
    Retryable,
    /// Malformed recipients, permanent SMTP 5xx rejections.
    Terminal,
}

impl core::fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            DeliveryErrorKind::Retryable => "retryable",
            DeliveryErrorKind::Terminal => "terminal",
        })
    }
}

/// A classified delivery failure.
#[derive(Debug, Clone, Error)]
#[error("delivery failed ({kind}): {reason}")]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub reason: String,
}

impl DeliveryError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Retryable,
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Terminal,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == DeliveryErrorKind::Retryable
    }
}

/// One-shot mail transport.
///
/// Implementations carry their own per-call timeout; an elapsed timeout is
/// reported as a retryable failure.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(
        &self,
        recipients: &[EmailAddress],
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError>;
}
