//! Room-scoped timers and tickers
//!
//! The supervisor only holds cancellation handles. Every pending timer and
//! ticker of a room hangs off one root token, so `cancel_all` tears them down
//! in a single step and nothing keeps firing against a closed room.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::ViewerId;

/// Identity of a supervised timer; scheduling an existing key replaces it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    OfferAck(ViewerId),
    SessionRetry(ViewerId),
    HealthTicker,
    Reconnect,
    RecoveryGrace,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OfferAck(viewer_id) => write!(f, "offer-ack:{viewer_id}"),
            Self::SessionRetry(viewer_id) => write!(f, "session-retry:{viewer_id}"),
            Self::HealthTicker => f.write_str("health-ticker"),
            Self::Reconnect => f.write_str("reconnect"),
            Self::RecoveryGrace => f.write_str("recovery-grace"),
        }
    }
}

struct Entry {
    generation: u64,
    token: CancellationToken,
}

pub struct ResourceSupervisor {
    root: Mutex<CancellationToken>,
    entries: Arc<Mutex<HashMap<TaskKey, Entry>>>,
    next_generation: AtomicU64,
}

impl ResourceSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Mutex::new(CancellationToken::new()),
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run `task` once after `delay` unless cancelled first
    ///
    /// Once the delay elapses the entry is released and `task` runs to
    /// completion, so a task may safely re-schedule its own key.
    pub fn schedule<F>(&self, key: TaskKey, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.lock().child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entries = Arc::clone(&self.entries);
        let task_key = key.clone();
        let task_token = token.clone();

        let mut guard = self.entries.lock();
        tokio::spawn(async move {
            tokio::select! {
                () = task_token.cancelled() => {
                    debug!(key = %task_key, "Supervised timer cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            release(&entries, &task_key, generation);
            task.await;
        });

        if let Some(previous) = guard.insert(key, Entry { generation, token }) {
            previous.token.cancel();
        }
    }

    /// Call `tick` every `period` (first call after one period) until cancelled
    pub fn spawn_ticker<F, Fut>(&self, key: TaskKey, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.lock().child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entries = Arc::clone(&self.entries);
        let task_key = key.clone();
        let task_token = token.clone();

        let mut guard = self.entries.lock();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            release(&entries, &task_key, generation);
            debug!(key = %task_key, "Supervised ticker stopped");
        });

        if let Some(previous) = guard.insert(key, Entry { generation, token }) {
            previous.token.cancel();
        }
    }

    /// Token for a room-scoped subscription, cancelled by `cancel_all`
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.root.lock().child_token()
    }

    /// Cancel one pending timer or ticker; returns whether one was pending
    pub fn cancel(&self, key: &TaskKey) -> bool {
        self.entries.lock().remove(key).is_some_and(|entry| {
            entry.token.cancel();
            true
        })
    }

    #[must_use]
    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of pending timers and running tickers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Cancel every timer and ticker at once; returns how many were pending
    pub fn cancel_all(&self) -> usize {
        let mut root = self.root.lock();
        root.cancel();
        *root = CancellationToken::new();

        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }
}

impl Default for ResourceSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceSupervisor {
    fn drop(&mut self) {
        self.root.lock().cancel();
    }
}

fn release(entries: &Mutex<HashMap<TaskKey, Entry>>, key: &TaskKey, generation: u64) {
    let mut entries = entries.lock();
    if entries
        .get(key)
        .is_some_and(|entry| entry.generation == generation)
    {
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let supervisor = ResourceSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        supervisor.schedule(TaskKey::Reconnect, Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(supervisor.is_scheduled(&TaskKey::Reconnect));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let supervisor = ResourceSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&fired);
            supervisor.schedule(
                TaskKey::OfferAck(ViewerId::from("v1")),
                Duration::from_secs(10),
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        assert_eq!(supervisor.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_everything() {
        let supervisor = ResourceSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        supervisor.schedule(TaskKey::Reconnect, Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&fired);
        supervisor.spawn_ticker(TaskKey::HealthTicker, Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(supervisor.cancel_all(), 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_ticks_until_cancelled() {
        let supervisor = ResourceSupervisor::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        supervisor.spawn_ticker(TaskKey::HealthTicker, Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(supervisor.cancel(&TaskKey::HealthTicker));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
