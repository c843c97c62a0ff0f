//! In-memory dispatch queue for tests and local runs.
//!
//! Models the broker contract the workers rely on: deliveries stay unacked
//! until `ack`/`nack`, and [`InMemoryQueue::redeliver_unacked`] plays the
//! role of the broker's redelivery timer so at-least-once scenarios can be
//! driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use lyceum_dispatch::queue::{DispatchQueue, QueueDelivery, QueueError, QueueMessage};

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<String>,
    unacked: HashMap<String, String>,
    next_receipt: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary body. Lets tests inject poison payloads that
    /// [`QueueMessage::encode`] could never produce.
    pub fn publish_raw(&self, body: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready.push_back(body.into());
        drop(inner);
        self.notify.notify_one();
    }

    /// Move every unacked delivery back to the front of the ready queue,
    /// as a broker would after a consumer crash or pending timeout.
    pub fn redeliver_unacked(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let bodies: Vec<String> = inner.unacked.drain().map(|(_, body)| body).collect();
        let count = bodies.len();
        for body in bodies {
            inner.ready.push_front(body);
        }
        drop(inner);
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    /// Stop delivering; subsequent `receive` calls fail with `Closed`.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn ready_count(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unwrap().unacked.len()
    }

    fn try_take(&self) -> Result<Option<QueueDelivery>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        match inner.ready.pop_front() {
            Some(body) => {
                let receipt = inner.next_receipt.to_string();
                inner.next_receipt += 1;
                inner.unacked.insert(receipt.clone(), body.clone());
                Ok(Some(QueueDelivery { receipt, body }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            inner.ready.push_back(message.encode());
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<QueueDelivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A missed wake-up only costs one loop turn, so a lost race with
            // notify_one is harmless.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &QueueDelivery) -> Result<(), QueueError> {
        self.inner.lock().unwrap().unacked.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &QueueDelivery, requeue: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unacked.remove(&delivery.receipt).is_some() && requeue {
            inner.ready.push_front(delivery.body.clone());
            drop(inner);
            self.notify.notify_one();
        }
        Ok(())
    }
}
