//! Scriptable delivery client for tests.
//!
//! Outcomes are consumed in push order; once the script runs dry every send
//! succeeds. The hanging variants let shutdown tests hold an attempt in
//! flight for a controlled amount of time.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use lyceum_core::EmailAddress;
use lyceum_dispatch::mailer::{DeliveryClient, DeliveryError};

/// What the next scripted send should do.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed,
    FailRetryable(String),
    FailTerminal(String),
    /// Sleep, then succeed. Models a slow but completing delivery.
    HangFor(Duration),
    /// Never resolve. Models a wedged transport for forced-shutdown tests.
    HangForever,
}

/// One recorded send call.
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub recipients: Vec<EmailAddress>,
    pub subject: String,
}

#[derive(Debug, Default)]
pub struct FakeDeliveryClient {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    delivered: Mutex<Vec<SentEmail>>,
}

impl FakeDeliveryClient {
    /// A client whose every send succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn script(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        let client = Self::new();
        client.script.lock().unwrap().extend(outcomes);
        client
    }

    /// Emails that were actually delivered (sends that returned `Ok`).
    pub fn delivered(&self) -> Vec<SentEmail> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryClient for FakeDeliveryClient {
    async fn send(
        &self,
        recipients: &[EmailAddress],
        subject: &str,
        _body: &str,
    ) -> Result<(), DeliveryError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedOutcome::Succeed);

        match outcome {
            ScriptedOutcome::Succeed => {}
            ScriptedOutcome::FailRetryable(reason) => return Err(DeliveryError::retryable(reason)),
            ScriptedOutcome::FailTerminal(reason) => return Err(DeliveryError::terminal(reason)),
            ScriptedOutcome::HangFor(duration) => tokio::time::sleep(duration).await,
            ScriptedOutcome::HangForever => std::future::pending::<()>().await,
        }

        self.delivered.lock().unwrap().push(SentEmail {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
        });
        Ok(())
    }
}
