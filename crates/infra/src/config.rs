//! Environment-driven configuration for the dispatch services.
//!
//! Everything has a local-development default except `SMTP_PASSWORD`; a
//! production deployment is expected to set the lot explicitly.

use std::time::Duration;

use tracing::warn;

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender address, e.g. `"Lyceum <no-reply@lyceum.example>"`.
    pub from: String,
    pub timeout: Duration,
}

/// Notifier runtime configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub database_url: String,
    pub redis_url: String,
    /// Stream key the wake-up messages travel on.
    pub queue_key: String,
    pub smtp: SmtpSettings,
    /// Delivery attempts per record before freezing it as failed.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt up to `max_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Concurrent in-flight deliveries per notifier instance.
    pub concurrency: usize,
    /// How long a graceful shutdown waits for in-flight deliveries.
    pub shutdown_deadline: Duration,
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` in disguise, split out
    /// so defaults and parsing are testable without touching process state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: string_or(&lookup, "DATABASE_URL", "postgres://localhost/lyceum"),
            redis_url: string_or(&lookup, "REDIS_URL", "redis://localhost:6379"),
            queue_key: string_or(&lookup, "DISPATCH_QUEUE", "lyceum:email"),
            smtp: SmtpSettings {
                host: string_or(&lookup, "SMTP_HOST", "localhost"),
                port: parsed_or(&lookup, "SMTP_PORT", 587u16),
                username: lookup("SMTP_USER"),
                password: lookup("SMTP_PASSWORD"),
                from: string_or(&lookup, "SMTP_FROM", "no-reply@lyceum.example"),
                timeout: Duration::from_secs(parsed_or(&lookup, "SMTP_TIMEOUT_SECS", 10u64)),
            },
            max_attempts: parsed_or(&lookup, "DISPATCH_MAX_ATTEMPTS", 3u32),
            base_delay: Duration::from_millis(parsed_or(&lookup, "DISPATCH_BASE_DELAY_MS", 500u64)),
            max_delay: Duration::from_secs(parsed_or(&lookup, "DISPATCH_MAX_DELAY_SECS", 60u64)),
            concurrency: parsed_or(&lookup, "DISPATCH_CONCURRENCY", 4usize),
            shutdown_deadline: Duration::from_secs(parsed_or(&lookup, "SHUTDOWN_DEADLINE_SECS", 30u64)),
        }
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| {
        warn!(key, default, "environment variable not set, using default");
        default.to_string()
    })
}

fn parsed_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw, %default, "unparseable environment variable, using default");
                default
            }
        },
        None => default,
    }
}
