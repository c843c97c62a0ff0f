//! Postgres-backed outbox store.
//!
//! ## Schema
//!
//! Migrations are owned by the surrounding application; this store expects:
//!
//! ```sql
//! CREATE TABLE email_outbox (
//!     id              UUID PRIMARY KEY,
//!     message_id      UUID        NOT NULL,
//!     recipients      JSONB       NOT NULL,
//!     subject         TEXT        NOT NULL,
//!     body            TEXT        NOT NULL,
//!     status          TEXT        NOT NULL DEFAULT 'pending',
//!     attempt_count   INTEGER     NOT NULL DEFAULT 0,
//!     last_error      TEXT,
//!     created_at      TIMESTAMPTZ NOT NULL,
//!     updated_at      TIMESTAMPTZ NOT NULL,
//!     sent_at         TIMESTAMPTZ,
//!     next_attempt_at TIMESTAMPTZ
//! );
//! CREATE INDEX email_outbox_claimable_idx ON email_outbox (status, next_attempt_at);
//! ```
//!
//! ## The claim CAS
//!
//! `mark_sending` is one conditional `UPDATE`: the row moves to `sending`
//! (incrementing `attempt_count`) only if it is currently `pending` with any
//! backoff window elapsed. Two consumers racing on the same id hit the same
//! row lock and exactly one gets a `RETURNING attempt_count` row back; the
//! winner keys its retry decision off that post-increment count, so there is
//! no read-then-write window at the application layer. The same shape guards
//! the other transitions (`sent` only from `sending`, `failed` never from
//! `sent`), so the write-once invariant on delivered records holds at the
//! database, not by convention.
//!
//! ## Thread safety
//!
//! `PostgresOutboxStore` is `Send + Sync`; all operations go through the
//! SQLx connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use sqlx::postgres::PgRow;
use tracing::{debug, instrument};

use lyceum_core::{EmailAddress, MessageId, OutboxId};
use lyceum_dispatch::record::{DeliveryStatus, NewOutboxRecord, OutboxRecord};
use lyceum_dispatch::store::{OutboxStore, OutboxStoreError};

/// Postgres adapter for the outbox.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create a record inside the caller's transaction.
    ///
    /// This is the outbox pattern's whole point: the email obligation commits
    /// or rolls back together with the business write that caused it. The
    /// caller publishes the wake-up after commit (see
    /// `Dispatcher::publish_wakeup`).
    #[instrument(skip(self, tx, new), fields(message_id = %new.message_id), err)]
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: NewOutboxRecord,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        let record = OutboxRecord::create(new, Utc::now());
        insert_record(&mut **tx, &record).await?;
        Ok(record)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, new), fields(message_id = %new.message_id), err)]
    async fn create(&self, new: NewOutboxRecord) -> Result<OutboxRecord, OutboxStoreError> {
        let record = OutboxRecord::create(new, Utc::now());
        insert_record(&*self.pool, &record).await?;
        Ok(record)
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn load(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, message_id, recipients, subject, body, status,
                   attempt_count, last_error, created_at, updated_at,
                   sent_at, next_attempt_at
            FROM email_outbox
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        match row {
            Some(row) => {
                let row = OutboxRow::from_row(&row)
                    .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
                Ok(Some(row.try_into()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(outbox_id = %id))]
    async fn mark_sending(&self, id: OutboxId) -> Result<Option<u32>, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = 'sending',
                attempt_count = attempt_count + 1,
                updated_at = $2
            WHERE id = $1
              AND status = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
            RETURNING attempt_count
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_sending", e))?;

        match row {
            Some(row) => {
                let count: i32 = row
                    .try_get("attempt_count")
                    .map_err(|e| map_sqlx_error("mark_sending", e))?;
                Ok(Some(count.max(0) as u32))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = 'sent', sent_at = $2, last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", e))?;

        if result.rows_affected() == 0 {
            debug!(outbox_id = %id, "mark_sent matched no sending row");
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn mark_failed_retry(
        &self,
        id: OutboxId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = 'pending', last_error = $2, next_attempt_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(next_attempt_at)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_retry", e))?;

        if result.rows_affected() == 0 {
            debug!(outbox_id = %id, "mark_failed_retry matched no sending row");
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn mark_failed_terminal(
        &self,
        id: OutboxId,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        // `status <> 'sent'` keeps delivered records write-once even if a
        // late terminal classification races a concurrent success.
        let result = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = 'failed', last_error = $2, updated_at = $3
            WHERE id = $1 AND status <> 'sent'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_terminal", e))?;

        if result.rows_affected() == 0 {
            debug!(outbox_id = %id, "mark_failed_terminal skipped a sent row");
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<OutboxId>, OutboxStoreError> {
        let stale_before = now - stale_after;
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM email_outbox
            WHERE status = 'pending'
              AND (
                    next_attempt_at <= $1
                 OR (next_attempt_at IS NULL AND updated_at <= $2)
              )
            ORDER BY COALESCE(next_attempt_at, updated_at)
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_for_retry", e))?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("id")
                    .map(OutboxId::from_uuid)
                    .map_err(|e| OutboxStoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

async fn insert_record<'e, E>(executor: E, record: &OutboxRecord) -> Result<(), OutboxStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let recipients = serde_json::to_value(&record.recipients)
        .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO email_outbox
            (id, message_id, recipients, subject, body, status,
             attempt_count, last_error, created_at, updated_at, sent_at, next_attempt_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(record.message_id.as_uuid())
    .bind(recipients)
    .bind(&record.subject)
    .bind(&record.body)
    .bind(record.status.as_str())
    .bind(record.attempt_count as i32)
    .bind(&record.last_error)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.sent_at)
    .bind(record.next_attempt_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("create", e))?;

    Ok(())
}

/// Raw row shape; converted into the domain record after decode.
#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    message_id: uuid::Uuid,
    recipients: serde_json::Value,
    subject: String,
    body: String,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            recipients: row.try_get("recipients")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            sent_at: row.try_get("sent_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let recipients: Vec<EmailAddress> = serde_json::from_value(row.recipients)
            .map_err(|e| OutboxStoreError::Serialization(format!("recipients: {e}")))?;
        let status: DeliveryStatus = row
            .status
            .parse()
            .map_err(|e| OutboxStoreError::Serialization(format!("status: {e}")))?;

        Ok(OutboxRecord {
            id: OutboxId::from_uuid(row.id),
            message_id: MessageId::from_uuid(row.message_id),
            recipients,
            subject: row.subject,
            body: row.body,
            status,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
            next_attempt_at: row.next_attempt_at,
        })
    }
}

/// Map SQLx errors onto the store error, keeping the operation for context.
///
/// | SQLx error            | Mapped to        | Scenario                       |
/// |-----------------------|------------------|--------------------------------|
/// | `Database`            | `Storage`        | constraint/driver errors       |
/// | `PoolClosed`/`Io`/…   | `Storage`        | pool shut down, network faults |
/// | decode failures       | `Serialization`  | unexpected row shapes          |
fn map_sqlx_error(operation: &str, e: sqlx::Error) -> OutboxStoreError {
    match e {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            OutboxStoreError::Serialization(format!("{operation}: {e}"))
        }
        other => OutboxStoreError::Storage(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_row() -> OutboxRow {
        let now = Utc::now();
        OutboxRow {
            id: uuid::Uuid::now_v7(),
            message_id: uuid::Uuid::now_v7(),
            recipients: json!(["registrar@school.example"]),
            subject: "Enrollment confirmed".into(),
            body: "Welcome aboard.".into(),
            status: "pending".into(),
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            next_attempt_at: None,
        }
    }

    #[test]
    fn row_converts_into_domain_record() {
        let row = sample_row();
        let id = row.id;

        let record = OutboxRecord::try_from(row).unwrap();

        assert_eq!(record.id, OutboxId::from_uuid(id));
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.recipients.len(), 1);
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn unknown_status_is_a_serialization_error() {
        let mut row = sample_row();
        row.status = "exploded".into();

        let err = OutboxRecord::try_from(row).unwrap_err();
        assert!(matches!(err, OutboxStoreError::Serialization(_)));
    }

    #[test]
    fn malformed_recipients_json_is_a_serialization_error() {
        let mut row = sample_row();
        row.recipients = json!({"not": "a list"});

        let err = OutboxRecord::try_from(row).unwrap_err();
        assert!(matches!(err, OutboxStoreError::Serialization(_)));
    }
}
