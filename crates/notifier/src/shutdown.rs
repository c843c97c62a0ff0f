//! Shutdown coordination.
//!
//! The coordinator carries two pieces of state: a stop flag (watch channel,
//! so waiters see a trigger that happened before they subscribed) and an
//! in-flight counter guarded by RAII. The worker stops taking new messages
//! the moment the flag flips, then `drain` waits for the counter to reach
//! zero or for the deadline, whichever comes first. Deliveries still in
//! flight at the deadline keep their queue messages unacknowledged, so the
//! broker redelivers them after restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::info;

#[derive(Debug)]
pub struct ShutdownCoordinator {
    stop_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Flip the stop flag. Idempotent.
    pub fn trigger(&self) {
        self.stop_tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once shutdown has been triggered (immediately if it already
    /// was).
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        // Only fails if the sender is gone, which cannot outlive `self`.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Register one in-flight delivery. The returned guard decrements the
    /// counter on drop, including on panic.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            coordinator: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait up to `deadline` for all in-flight deliveries to finish.
    /// Returns `true` on a clean drain.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            // Arm before checking the counter so a guard dropped in between
            // cannot be missed.
            let drained = self.drained.notified();
            if self.in_flight() == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, drained).await;
        }
    }
}

/// RAII handle for one in-flight delivery.
pub struct InFlightGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.coordinator.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.coordinator.drained.notify_waiters();
        }
    }
}

/// Resolve on SIGINT or SIGTERM and trigger the coordinator.
pub async fn wait_for_signals(coordinator: Arc<ShutdownCoordinator>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
            return;
        }
        info!("received ctrl-c");
    }

    coordinator.trigger();
}
