//! Reconnection policy.
//!
//! Two layers: [`ReconnectionManager::attempt_reconnection`] makes one finite
//! pass over a list of progressively longer connect timeouts, and
//! [`ReconnectionManager::schedule_reconnection`] runs that pass in the
//! background after a delay, repeating until it succeeds or is cancelled.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::config::ReconnectConfig;
use crate::error::Result;
use crate::types::PhysicalIdentity;

/// Something that can be (re)connected with a bounded wait
pub trait Reconnectable: Send + Sync {
    /// Start connecting and wait up to `timeout` for the link to come up
    fn try_connect(&self, timeout: Duration) -> BoxFuture<'_, Result<()>>;
}

impl<T: Reconnectable + ?Sized> Reconnectable for Arc<T> {
    fn try_connect(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        (**self).try_connect(timeout)
    }
}

/// Result of one reconnection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub success: bool,
    /// Number of connect attempts made
    pub attempts: usize,
}

/// Background retry bookkeeping for one receiver
struct ScheduledReconnect {
    generation: u64,
    /// Completed passes that failed
    cycles: u32,
    stop_tx: broadcast::Sender<()>,
}

struct Shared {
    timeouts: Vec<Duration>,
    schedule_delay: Duration,
    timers: Mutex<HashMap<PhysicalIdentity, ScheduledReconnect>>,
    next_generation: AtomicU64,
}

/// Reconnection attempts and background retries, keyed by physical receiver
#[derive(Clone)]
pub struct ReconnectionManager {
    shared: Arc<Shared>,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

impl ReconnectionManager {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                timeouts: config.timeouts(),
                schedule_delay: config.schedule_delay(),
                timers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Try to connect once per configured timeout, stopping at the first success
    pub async fn attempt_reconnection<T>(
        &self,
        identity: &PhysicalIdentity,
        target: &T,
    ) -> ReconnectOutcome
    where
        T: Reconnectable + ?Sized,
    {
        let timeouts = &self.shared.timeouts;

        for (index, timeout) in timeouts.iter().enumerate() {
            let attempt = index + 1;
            tracing::info!(
                device = %identity,
                attempt,
                "Reconnecting (timeout {:?})",
                timeout
            );

            match target.try_connect(*timeout).await {
                Ok(()) => {
                    tracing::info!(device = %identity, attempt, "Reconnected");
                    return ReconnectOutcome {
                        success: true,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    tracing::warn!(device = %identity, attempt, "Reconnect attempt failed: {}", e);
                }
            }
        }

        ReconnectOutcome {
            success: false,
            attempts: timeouts.len(),
        }
    }

    /// Retry in the background until connected or cancelled
    ///
    /// Replaces any retry already scheduled for `identity`. Before each pass
    /// the task waits the schedule delay and consults `should_skip`; a `true`
    /// answer ends the retry. `on_reconnected` runs once after a successful
    /// pass.
    pub fn schedule_reconnection<T, S, F>(
        &self,
        identity: PhysicalIdentity,
        target: T,
        should_skip: S,
        on_reconnected: F,
    ) where
        T: Reconnectable + 'static,
        S: Fn() -> bool + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.cancel_scheduled_reconnection(&identity);

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let delay = self.shared.schedule_delay;
        let manager = self.clone();

        // Insert under the lock so the task cannot finish before its record exists
        let mut timers = self.shared.timers.lock().unwrap();
        let task_identity = identity.clone();

        tokio::spawn(async move {
            let identity = task_identity;
            loop {
                tracing::info!(device = %identity, "Next reconnection attempt in {:?}", delay);

                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::debug!(device = %identity, "Scheduled reconnection cancelled");
                        return;
                    }
                    _ = sleep(delay) => {}
                }

                if should_skip() {
                    tracing::info!(device = %identity, "Skipping scheduled reconnection");
                    manager.remove_timer(&identity, generation);
                    return;
                }

                let outcome = manager.attempt_reconnection(&identity, &target).await;
                if outcome.success {
                    manager.remove_timer(&identity, generation);
                    on_reconnected();
                    return;
                }

                // Cancelled while the attempt was running
                if !matches!(stop_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                    return;
                }

                manager.bump_cycles(&identity, generation);
            }
        });

        timers.insert(
            identity,
            ScheduledReconnect {
                generation,
                cycles: 0,
                stop_tx,
            },
        );
    }

    /// Stop the background retry for one receiver
    ///
    /// An attempt already in progress is not interrupted, but no further
    /// attempts are made. Returns whether a retry was scheduled.
    pub fn cancel_scheduled_reconnection(&self, identity: &PhysicalIdentity) -> bool {
        let removed = self.shared.timers.lock().unwrap().remove(identity);
        match removed {
            Some(timer) => {
                tracing::debug!(device = %identity, "Cancelling scheduled reconnection");
                let _ = timer.stop_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Stop every background retry
    pub fn cancel_all_scheduled_reconnections(&self) {
        let timers: Vec<_> = self.shared.timers.lock().unwrap().drain().collect();
        for (identity, timer) in timers {
            tracing::debug!(device = %identity, "Cancelling scheduled reconnection");
            let _ = timer.stop_tx.send(());
        }
    }

    pub fn is_scheduled(&self, identity: &PhysicalIdentity) -> bool {
        self.shared.timers.lock().unwrap().contains_key(identity)
    }

    /// Failed background passes so far, if a retry is scheduled
    pub fn scheduled_cycles(&self, identity: &PhysicalIdentity) -> Option<u32> {
        self.shared
            .timers
            .lock()
            .unwrap()
            .get(identity)
            .map(|t| t.cycles)
    }

    fn remove_timer(&self, identity: &PhysicalIdentity, generation: u64) {
        let mut timers = self.shared.timers.lock().unwrap();
        if timers.get(identity).is_some_and(|t| t.generation == generation) {
            timers.remove(identity);
        }
    }

    fn bump_cycles(&self, identity: &PhysicalIdentity, generation: u64) {
        let mut timers = self.shared.timers.lock().unwrap();
        if let Some(timer) = timers.get_mut(identity) {
            if timer.generation == generation {
                timer.cycles += 1;
                tracing::warn!(
                    device = %identity,
                    cycles = timer.cycles,
                    "Reconnection failed, retrying"
                );
            }
        }
    }
}
