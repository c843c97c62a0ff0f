//! In-memory outbox store for tests and local runs.
//!
//! Applies exactly the same transition rules as the Postgres store by
//! delegating to the record's lifecycle methods under a write lock, so the
//! claim CAS is atomic here too.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use lyceum_core::OutboxId;
use lyceum_dispatch::record::{DeliveryStatus, NewOutboxRecord, OutboxRecord};
use lyceum_dispatch::store::{OutboxStore, OutboxStoreError};

#[derive(Debug, Default, Clone)]
pub struct InMemoryOutboxStore {
    records: Arc<RwLock<HashMap<OutboxId, OutboxRecord>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing `create`. Test helper.
    pub async fn insert(&self, record: OutboxRecord) {
        self.records.write().await.insert(record.id, record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn with_record<F>(&self, id: OutboxId, f: F) -> Result<(), OutboxStoreError>
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn create(&self, new: NewOutboxRecord) -> Result<OutboxRecord, OutboxStoreError> {
        let record = OutboxRecord::create(new, Utc::now());
        self.records.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn load(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn mark_sending(&self, id: OutboxId) -> Result<Option<u32>, OutboxStoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => Ok(record.begin_attempt(Utc::now())),
            None => Ok(None),
        }
    }

    async fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxStoreError> {
        self.with_record(id, |r| {
            r.complete(Utc::now());
        })
        .await
    }

    async fn mark_failed_retry(
        &self,
        id: OutboxId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.with_record(id, |r| {
            r.schedule_retry(error, next_attempt_at, Utc::now());
        })
        .await
    }

    async fn mark_failed_terminal(
        &self,
        id: OutboxId,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        self.with_record(id, |r| {
            r.fail_terminal(error, Utc::now());
        })
        .await
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<OutboxId>, OutboxStoreError> {
        let stale_before = now - stale_after;
        let records = self.records.read().await;
        let mut due: Vec<&OutboxRecord> = records
            .values()
            .filter(|r| r.status == DeliveryStatus::Pending)
            .filter(|r| match r.next_attempt_at {
                Some(at) => at <= now,
                None => r.updated_at <= stale_before,
            })
            .collect();
        due.sort_by_key(|r| r.next_attempt_at.unwrap_or(r.updated_at));
        Ok(due.into_iter().take(limit).map(|r| r.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lyceum_core::{EmailAddress, MessageId};

    fn new_record() -> NewOutboxRecord {
        NewOutboxRecord::new(
            MessageId::new(),
            vec![EmailAddress::parse("guardian@family.example").unwrap()],
            "Attendance alert",
            "Absence recorded for period 2.",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_claim_then_sent() {
        let store = InMemoryOutboxStore::new();
        let record = store.create(new_record()).await.unwrap();

        assert_eq!(store.mark_sending(record.id).await.unwrap(), Some(1));
        store.mark_sent(record.id).await.unwrap();

        let loaded = store.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Sent);
        assert_eq!(loaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_winner() {
        let store = InMemoryOutboxStore::new();
        let record = store.create(new_record()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = record.id;
            handles.push(tokio::spawn(async move { store.mark_sending(id).await.unwrap() }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.load(record.id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn mark_sending_unknown_id_is_a_lost_swap_not_an_error() {
        let store = InMemoryOutboxStore::new();
        assert!(store.mark_sending(OutboxId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_for_retry_orders_by_due_instant_and_honors_limit() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        let first = store.create(new_record()).await.unwrap();
        let second = store.create(new_record()).await.unwrap();
        for (id, delay_secs) in [(second.id, -5), (first.id, -10)] {
            assert!(store.mark_sending(id).await.unwrap().is_some());
            store
                .mark_failed_retry(id, "451 try later", now + Duration::seconds(delay_secs))
                .await
                .unwrap();
        }

        let due = store
            .due_for_retry(now, Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(due, vec![first.id, second.id]);

        let due = store.due_for_retry(now, Duration::minutes(5), 1).await.unwrap();
        assert_eq!(due, vec![first.id]);
    }

    #[tokio::test]
    async fn due_for_retry_includes_stale_never_published_records() {
        let store = InMemoryOutboxStore::new();
        let record = store.create(new_record()).await.unwrap();

        // Fresh records without a scheduled attempt are presumed to have a
        // wake-up in flight; only stale ones get swept.
        let now = Utc::now();
        let due = store.due_for_retry(now, Duration::minutes(5), 10).await.unwrap();
        assert!(due.is_empty());

        let due = store
            .due_for_retry(now + Duration::minutes(10), Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(due, vec![record.id]);
    }
}
