//! SMTP transport adapter.
//!
//! Owns the mapping from SMTP outcomes into the retryable/terminal split:
//! permanent 5xx rejections and unbuildable messages are terminal; timeouts,
//! connection failures and transient 4xx responses are retryable.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::instrument;

use lyceum_core::EmailAddress;
use lyceum_dispatch::mailer::{DeliveryClient, DeliveryError};

use crate::config::SmtpSettings;

pub struct SmtpDeliveryClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpDeliveryClient {
    /// Build a STARTTLS transport from settings. Fails fast on an
    /// unresolvable relay host or an unparseable sender address.
    pub fn new(settings: &SmtpSettings) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
            .port(settings.port)
            .timeout(Some(settings.timeout));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid sender address {:?}: {e}", settings.from))?;

        Ok(Self {
            transport: builder.build(),
            from,
            timeout: settings.timeout,
        })
    }

    fn build_message(
        &self,
        recipients: &[EmailAddress],
        subject: &str,
        body: &str,
    ) -> Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in recipients {
            let mailbox: Mailbox = recipient
                .as_str()
                .parse()
                .map_err(|e| DeliveryError::terminal(format!("invalid recipient {recipient}: {e}")))?;
            builder = builder.to(mailbox);
        }
        builder
            .body(body.to_string())
            .map_err(|e| DeliveryError::terminal(format!("message build failed: {e}")))
    }
}

#[async_trait]
impl DeliveryClient for SmtpDeliveryClient {
    #[instrument(skip_all, fields(recipients = recipients.len()))]
    async fn send(
        &self,
        recipients: &[EmailAddress],
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let message = self.build_message(recipients, subject, body)?;

        // The transport carries its own IO timeout; the outer one bounds the
        // whole exchange including connection setup and TLS.
        let sent = tokio::time::timeout(self.timeout, self.transport.send(message))
            .await
            .map_err(|_| DeliveryError::retryable(format!("smtp send timed out after {:?}", self.timeout)))?;

        match sent {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(DeliveryError::terminal(e.to_string())),
            Err(e) => Err(DeliveryError::retryable(e.to_string())),
        }
    }
}
