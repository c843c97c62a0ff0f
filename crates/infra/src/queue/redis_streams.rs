//! Redis Streams-backed dispatch queue (durable, at-least-once delivery).
//!
//! Uses XADD/XREADGROUP with a consumer group so that:
//! - wake-ups persist until XACK'd;
//! - an entry left pending by a crashed or force-killed consumer is
//!   reclaimed (XPENDING + XCLAIM) once it has sat idle past
//!   `PENDING_TIMEOUT`, which is what makes redelivery actually happen;
//! - multiple notifier instances in one group load-balance entries.
//!
//! Two multiplexed connections are held: `XREADGROUP BLOCK` parks the
//! connection it runs on, so reads get their own while publishes and acks
//! share the other. Entry ids double as receipt handles.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use lyceum_dispatch::queue::{DispatchQueue, QueueDelivery, QueueError, QueueMessage};

/// Entries idle longer than this are considered abandoned and reclaimed.
const PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// Field name carrying the JSON wake-up payload.
const BODY_FIELD: &str = "body";

pub struct RedisStreamsQueue {
    stream_key: String,
    group: String,
    consumer: String,
    /// Dedicated connection for blocking reads.
    read_conn: Mutex<MultiplexedConnection>,
    /// Shared connection for XADD/XACK.
    write_conn: Mutex<MultiplexedConnection>,
}

impl RedisStreamsQueue {
    /// Connect and ensure the consumer group exists (idempotent).
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, QueueError> {
        Self::connect_inner(redis_url, stream_key.into(), group.into(), consumer.into()).await
    }

    #[instrument(skip(redis_url), fields(stream_key = %stream_key, group = %group), err)]
    async fn connect_inner(
        redis_url: &str,
        stream_key: String,
        group: String,
        consumer: String,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let mut write_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let read_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        // XGROUP CREATE with MKSTREAM creates the stream on first use. An
        // existing group answers BUSYGROUP, which is the idempotent case.
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream_key)
            .arg(&group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut write_conn)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(QueueError::Command(format!("XGROUP CREATE failed: {e}")));
            }
        }

        Ok(Self {
            stream_key,
            group,
            consumer,
            read_conn: Mutex::new(read_conn),
            write_conn: Mutex::new(write_conn),
        })
    }

    /// Reclaim entries another (or a previous incarnation of this) consumer
    /// left pending for longer than [`PENDING_TIMEOUT`].
    async fn claim_stale(&self, conn: &mut MultiplexedConnection) -> Result<Option<QueueDelivery>, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(PENDING_TIMEOUT.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        let Some((id, _, _, _)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(PENDING_TIMEOUT.as_millis() as u64)
            .arg(&id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;

        for entry in claimed {
            if let Some(delivery) = parse_stream_entry(entry)? {
                debug!(receipt = %delivery.receipt, "reclaimed stale pending entry");
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DispatchQueue for RedisStreamsQueue {
    #[instrument(skip(self, message), fields(outbox_id = %message.outbox_id), err)]
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.write_conn.lock().await;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(message.encode())
            .query_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<QueueDelivery>, QueueError> {
        let mut conn = self.read_conn.lock().await;

        if let Some(delivery) = self.claim_stale(&mut conn).await? {
            return Ok(Some(delivery));
        }

        // BLOCK returns nil on timeout, which `Option` absorbs.
        let reply: Option<std::collections::HashMap<String, Vec<redis::Value>>> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(wait.as_millis() as u64)
                .arg("STREAMS")
                .arg(&self.stream_key)
                .arg(">")
                .query_async(&mut *conn)
                .await
                .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        let entries = match reply {
            Some(mut streams) => streams.remove(&self.stream_key).unwrap_or_default(),
            None => return Ok(None),
        };

        for entry in entries {
            if let Some(delivery) = parse_stream_entry(entry)? {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &QueueDelivery) -> Result<(), QueueError> {
        let mut conn = self.write_conn.lock().await;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .query_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn nack(&self, delivery: &QueueDelivery, requeue: bool) -> Result<(), QueueError> {
        // Streams have no broker-side nack: the entry is ack'd off the
        // pending list, and a requeue re-appends the body as a new entry.
        let mut conn = self.write_conn.lock().await;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .query_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;

        if requeue {
            let _: String = redis::cmd("XADD")
                .arg(&self.stream_key)
                .arg("*")
                .arg(BODY_FIELD)
                .arg(&delivery.body)
                .query_async(&mut *conn)
                .await
                .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        }
        Ok(())
    }
}

/// Parse one stream entry (`[id, [field, value, …]]`) into a delivery.
///
/// Returns `Ok(None)` for entries that were trimmed between XPENDING and
/// XCLAIM (they come back nil).
fn parse_stream_entry(entry: redis::Value) -> Result<Option<QueueDelivery>, QueueError> {
    let parts = match entry {
        redis::Value::Nil => return Ok(None),
        redis::Value::Bulk(parts) => parts,
        other => {
            return Err(QueueError::Command(format!(
                "unexpected stream entry shape: {other:?}"
            )))
        }
    };
    if parts.len() < 2 {
        return Err(QueueError::Command("stream entry too short".to_string()));
    }

    let receipt = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        other => {
            return Err(QueueError::Command(format!(
                "unexpected entry id shape: {other:?}"
            )))
        }
    };

    let fields = match &parts[1] {
        redis::Value::Bulk(fields) => fields,
        other => {
            return Err(QueueError::Command(format!(
                "unexpected entry fields shape: {other:?}"
            )))
        }
    };

    for pair in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
            if key.as_slice() == BODY_FIELD.as_bytes() {
                return Ok(Some(QueueDelivery {
                    receipt,
                    body: String::from_utf8_lossy(value).to_string(),
                }));
            }
        }
    }

    Err(QueueError::Command(format!(
        "stream entry {receipt} has no {BODY_FIELD} field"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_a_malformed_url() {
        let err = RedisStreamsQueue::connect("not a url", "lyceum:email", "notifier", "n-1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Connection(_)));
    }

    #[test]
    fn trimmed_entry_parses_to_none() {
        assert!(parse_stream_entry(redis::Value::Nil).unwrap().is_none());
    }

    #[test]
    fn entry_with_body_field_parses_to_a_delivery() {
        let entry = redis::Value::Bulk(vec![
            redis::Value::Data(b"1700000000000-0".to_vec()),
            redis::Value::Bulk(vec![
                redis::Value::Data(BODY_FIELD.as_bytes().to_vec()),
                redis::Value::Data(br#"{"outbox_id":"00000000-0000-0000-0000-000000000001"}"#.to_vec()),
            ]),
        ]);

        let delivery = parse_stream_entry(entry).unwrap().unwrap();
        assert_eq!(delivery.receipt, "1700000000000-0");
        assert!(delivery.body.contains("outbox_id"));
    }

    #[test]
    fn entry_without_body_field_is_an_error() {
        let entry = redis::Value::Bulk(vec![
            redis::Value::Data(b"1700000000000-0".to_vec()),
            redis::Value::Bulk(vec![
                redis::Value::Data(b"other".to_vec()),
                redis::Value::Data(b"x".to_vec()),
            ]),
        ]);

        assert!(matches!(parse_stream_entry(entry), Err(QueueError::Command(_))));
    }
}
