//! Infrastructure layer: storage, broker, mail transport, config.

pub mod config;
pub mod mailer;
pub mod outbox;
pub mod queue;

pub use config::{DispatchConfig, SmtpSettings};
pub use mailer::fake::FakeDeliveryClient;
pub use mailer::smtp::SmtpDeliveryClient;
pub use outbox::in_memory::InMemoryOutboxStore;
pub use outbox::postgres::PostgresOutboxStore;
pub use queue::in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use queue::redis_streams::RedisStreamsQueue;
