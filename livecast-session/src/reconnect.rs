//! Reconnection with exponential backoff and graceful recovery
//!
//! Two budgets share one backoff law, `base * 2^(n-1)` for attempt `n`:
//!
//! - the room budget covers signaling loss. Each attempt re-establishes the
//!   channel and re-creates every session; when it runs out, a recovery
//!   snapshot is persisted, viewers are notified and the room is force-stopped
//!   after a grace period (immediately if the snapshot could not be written).
//! - each viewer has a session budget covering its own transport. Only that
//!   viewer's session is re-opened; when the budget runs out the viewer is
//!   dropped and the room carries on.
//!
//! Every scheduled body carries the epoch it was scheduled in. [`reset`]
//! starts a new epoch, so work left over from a torn-down room does nothing.
//!
//! [`reset`]: ReconnectionManager::reset

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectConfig;
use crate::error::{Error, Result};
use crate::registry::RecreateReport;
use crate::snapshot::{RecoverySnapshot, SnapshotStore};
use crate::supervisor::{ResourceSupervisor, TaskKey};
use crate::types::ViewerId;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureScope {
    /// The signaling channel went away
    Signaling,
    /// One viewer's transport went down or went silent
    Session(ViewerId),
}

impl fmt::Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signaling => f.write_str("signaling"),
            Self::Session(viewer_id) => write!(f, "session {viewer_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectEvent {
    Scheduled { attempt: u32, delay: Duration },
    AttemptFailed { attempt: u32, error: String },
    Succeeded { attempt: u32, sessions: usize },
    RecoveryStarted { attempts: u32 },
    SnapshotPersisted(RecoverySnapshot),
    SnapshotFailed { error: String },
    /// The room was force-stopped; `graceful` is false when the grace period was skipped
    RecoveryCompleted { graceful: bool },
    SessionRetryScheduled { viewer_id: ViewerId, attempt: u32, delay: Duration },
    SessionReopened { viewer_id: ViewerId, attempt: u32 },
    SessionRetryFailed { viewer_id: ViewerId, attempt: u32, error: String },
    /// Session budget spent; the viewer is dropped from the room
    SessionAbandoned { viewer_id: ViewerId, attempts: u32 },
}

/// How a failure report was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Scheduled { attempt: u32, delay: Duration },
    /// An attempt is already pending and will cover this failure
    Coalesced,
    RecoveryStarted,
    /// The viewer ran out of session retries and is being dropped
    Abandoned,
    /// Recovery is already under way
    Ignored,
}

/// The operations a reconnection cycle drives
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Re-establish signaling if needed and re-create sessions for the roster
    async fn reestablish(&self) -> Result<RecreateReport>;

    /// Open a fresh session for one viewer; `Ok(false)` when it is no longer in the room
    async fn reopen_session(&self, viewer_id: &ViewerId) -> Result<bool>;

    /// Remove a viewer whose session could not be brought back
    async fn abandon_session(&self, viewer_id: &ViewerId, reason: &str);

    /// Snapshot of the room, `None` when no room is open
    fn recovery_snapshot(&self, attempts: u32, reason: &str) -> Option<RecoverySnapshot>;

    async fn announce_recovery(&self, snapshot: &RecoverySnapshot);

    async fn force_stop(&self, reason: &str);
}

#[derive(Debug, Default)]
struct SessionRetry {
    attempts: u32,
    scheduled: bool,
}

#[derive(Default)]
struct ReconnectState {
    attempts: u32,
    scheduled: bool,
    recovering: bool,
    sessions: HashMap<ViewerId, SessionRetry>,
}

pub struct ReconnectionManager {
    config: ReconnectConfig,
    supervisor: Arc<ResourceSupervisor>,
    snapshots: Arc<dyn SnapshotStore>,
    state: Mutex<ReconnectState>,
    epoch: AtomicU64,
    events: broadcast::Sender<ReconnectEvent>,
}

impl ReconnectionManager {
    pub fn new(
        config: ReconnectConfig,
        supervisor: Arc<ResourceSupervisor>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            supervisor,
            snapshots,
            state: Mutex::new(ReconnectState::default()),
            epoch: AtomicU64::new(0),
            events,
        }
    }

    /// Room-level attempts made since the last success
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Attempts that concern `viewer_id`: its own session retries, or the
    /// room's attempts while signaling is being re-established
    #[must_use]
    pub fn attempts_for(&self, viewer_id: &ViewerId) -> u32 {
        let state = self.state.lock();
        let session = state.sessions.get(viewer_id).map_or(0, |retry| retry.attempts);
        session.max(state.attempts)
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.state.lock().recovering
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    /// Forget all attempts and start a new epoch
    ///
    /// Pending timers belong to the supervisor; anything already running
    /// stops at its next epoch check.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = ReconnectState::default();
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// The viewer's session is healthy again, or the viewer is gone
    pub fn clear_session(&self, viewer_id: &ViewerId) -> bool {
        let cleared = self.state.lock().sessions.remove(viewer_id).is_some();
        if cleared {
            self.supervisor.cancel(&TaskKey::SessionRetry(viewer_id.clone()));
            debug!(viewer_id = %viewer_id, "Session retry budget cleared");
        }
        cleared
    }

    /// Report a failure of `scope`
    pub fn on_failure(
        self: &Arc<Self>,
        target: Weak<dyn RecoveryTarget>,
        scope: FailureScope,
        detail: &str,
    ) -> FailureDisposition {
        match scope {
            FailureScope::Signaling => self.on_room_failure(target, detail),
            FailureScope::Session(viewer_id) => self.on_session_failure(target, viewer_id, detail),
        }
    }

    fn on_room_failure(self: &Arc<Self>, target: Weak<dyn RecoveryTarget>, detail: &str) -> FailureDisposition {
        let mut state = self.state.lock();

        if state.recovering {
            debug!(detail = detail, "Signaling failure ignored during recovery");
            return FailureDisposition::Ignored;
        }
        if state.scheduled {
            debug!(detail = detail, "Signaling failure coalesced into pending attempt");
            return FailureDisposition::Coalesced;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        // The room attempt re-creates every session, so per-viewer retries are moot.
        let superseded: Vec<ViewerId> = state.sessions.drain().map(|(viewer_id, _)| viewer_id).collect();

        if state.attempts >= self.config.max_attempts {
            state.recovering = true;
            let attempts = state.attempts;
            drop(state);
            self.cancel_session_retries(superseded);

            let reason = format!("{}: {detail}", Error::RecoveryExhausted { attempts });
            error!(attempts = attempts, detail = detail, "Reconnection attempts exhausted, entering graceful recovery");
            let _ = self.events.send(ReconnectEvent::RecoveryStarted { attempts });
            let manager = Arc::clone(self);
            self.supervisor
                .schedule(TaskKey::Reconnect, Duration::ZERO, async move {
                    manager.recover(target, attempts, reason, epoch).await;
                });
            return FailureDisposition::RecoveryStarted;
        }

        state.attempts += 1;
        state.scheduled = true;
        let attempt = state.attempts;
        drop(state);
        self.cancel_session_retries(superseded);

        let delay = self.config.backoff_delay(attempt);
        info!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            detail = detail,
            "Reconnection scheduled"
        );
        let _ = self.events.send(ReconnectEvent::Scheduled { attempt, delay });

        let manager = Arc::clone(self);
        self.supervisor.schedule(TaskKey::Reconnect, delay, async move {
            manager.run_attempt(target, attempt, epoch).await;
        });
        FailureDisposition::Scheduled { attempt, delay }
    }

    fn on_session_failure(
        self: &Arc<Self>,
        target: Weak<dyn RecoveryTarget>,
        viewer_id: ViewerId,
        detail: &str,
    ) -> FailureDisposition {
        let mut state = self.state.lock();

        if state.recovering {
            debug!(viewer_id = %viewer_id, detail = detail, "Session failure ignored during recovery");
            return FailureDisposition::Ignored;
        }
        if state.scheduled {
            debug!(viewer_id = %viewer_id, detail = detail, "Session failure covered by room reconnection");
            return FailureDisposition::Coalesced;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let retry = state.sessions.entry(viewer_id.clone()).or_default();
        if retry.scheduled {
            debug!(viewer_id = %viewer_id, detail = detail, "Session failure coalesced into pending retry");
            return FailureDisposition::Coalesced;
        }

        if retry.attempts >= self.config.max_attempts {
            let attempts = retry.attempts;
            state.sessions.remove(&viewer_id);
            drop(state);

            warn!(
                viewer_id = %viewer_id,
                attempts = attempts,
                detail = detail,
                "Session retries exhausted, dropping viewer"
            );
            let _ = self.events.send(ReconnectEvent::SessionAbandoned {
                viewer_id: viewer_id.clone(),
                attempts,
            });
            let manager = Arc::clone(self);
            let reason = format!("session lost after {attempts} retries: {detail}");
            self.supervisor.schedule(
                TaskKey::SessionRetry(viewer_id.clone()),
                Duration::ZERO,
                async move {
                    if !manager.is_epoch(epoch) {
                        return;
                    }
                    if let Some(target) = target.upgrade() {
                        target.abandon_session(&viewer_id, &reason).await;
                    }
                },
            );
            return FailureDisposition::Abandoned;
        }

        retry.attempts += 1;
        retry.scheduled = true;
        let attempt = retry.attempts;
        drop(state);

        let delay = self.config.backoff_delay(attempt);
        info!(
            viewer_id = %viewer_id,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            detail = detail,
            "Session retry scheduled"
        );
        let _ = self.events.send(ReconnectEvent::SessionRetryScheduled {
            viewer_id: viewer_id.clone(),
            attempt,
            delay,
        });

        let manager = Arc::clone(self);
        self.supervisor.schedule(
            TaskKey::SessionRetry(viewer_id.clone()),
            delay,
            async move {
                manager.retry_session(target, viewer_id, attempt, epoch).await;
            },
        );
        FailureDisposition::Scheduled { attempt, delay }
    }

    async fn run_attempt(self: Arc<Self>, target: Weak<dyn RecoveryTarget>, attempt: u32, epoch: u64) {
        if !self.is_epoch(epoch) {
            return;
        }
        let Some(strong) = target.upgrade() else {
            self.state.lock().scheduled = false;
            return;
        };

        // Failures reported while the attempt runs are covered by it.
        let outcome = strong.reestablish().await;
        drop(strong);
        if !self.is_epoch(epoch) {
            debug!(attempt = attempt, "Reconnection attempt outlived its room");
            return;
        }
        self.state.lock().scheduled = false;

        match outcome {
            Ok(report) => {
                self.state.lock().attempts = 0;
                info!(
                    attempt = attempt,
                    sessions = report.recreated,
                    failed = report.failed.len(),
                    "Reconnection succeeded"
                );
                let _ = self.events.send(ReconnectEvent::Succeeded {
                    attempt,
                    sessions: report.recreated,
                });
                for (viewer_id, detail) in report.failed {
                    self.on_failure(target.clone(), FailureScope::Session(viewer_id), &detail);
                }
            }
            Err(e) => {
                warn!(attempt = attempt, error = %e, "Reconnection attempt failed");
                let _ = self.events.send(ReconnectEvent::AttemptFailed {
                    attempt,
                    error: e.to_string(),
                });
                self.on_failure(target, FailureScope::Signaling, &e.to_string());
            }
        }
    }

    async fn retry_session(
        self: Arc<Self>,
        target: Weak<dyn RecoveryTarget>,
        viewer_id: ViewerId,
        attempt: u32,
        epoch: u64,
    ) {
        if !self.is_epoch(epoch) {
            return;
        }
        let Some(strong) = target.upgrade() else {
            return;
        };

        let outcome = strong.reopen_session(&viewer_id).await;
        drop(strong);
        if !self.is_epoch(epoch) {
            return;
        }
        {
            let mut state = self.state.lock();
            match state.sessions.get_mut(&viewer_id) {
                Some(retry) => retry.scheduled = false,
                // Cleared while the retry ran
                None => return,
            }
        }

        match outcome {
            // The budget stays spent until the new session connects.
            Ok(true) => {
                info!(viewer_id = %viewer_id, attempt = attempt, "Session re-opened");
                let _ = self.events.send(ReconnectEvent::SessionReopened { viewer_id, attempt });
            }
            Ok(false) => {
                debug!(viewer_id = %viewer_id, "Viewer left before its session retry");
                self.state.lock().sessions.remove(&viewer_id);
            }
            Err(e) => {
                warn!(viewer_id = %viewer_id, attempt = attempt, error = %e, "Session retry failed");
                let _ = self.events.send(ReconnectEvent::SessionRetryFailed {
                    viewer_id: viewer_id.clone(),
                    attempt,
                    error: e.to_string(),
                });
                self.on_failure(target, FailureScope::Session(viewer_id), &e.to_string());
            }
        }
    }

    async fn recover(self: Arc<Self>, target: Weak<dyn RecoveryTarget>, attempts: u32, reason: String, epoch: u64) {
        if !self.is_epoch(epoch) {
            return;
        }
        let Some(strong) = target.upgrade() else {
            return;
        };

        let Some(snapshot) = strong.recovery_snapshot(attempts, &reason) else {
            strong.force_stop(&reason).await;
            self.finish_recovery(false);
            return;
        };

        if let Err(e) = self.snapshots.persist(&snapshot).await {
            error!(error = %e, "Recovery snapshot failed, stopping immediately");
            let _ = self.events.send(ReconnectEvent::SnapshotFailed {
                error: e.to_string(),
            });
            strong.force_stop(&reason).await;
            self.finish_recovery(false);
            return;
        }
        let _ = self
            .events
            .send(ReconnectEvent::SnapshotPersisted(snapshot.clone()));

        strong.announce_recovery(&snapshot).await;
        drop(strong);
        if !self.is_epoch(epoch) {
            return;
        }

        let manager = Arc::clone(&self);
        self.supervisor.schedule(
            TaskKey::RecoveryGrace,
            self.config.recovery_grace(),
            async move {
                if !manager.is_epoch(epoch) {
                    return;
                }
                if let Some(target) = target.upgrade() {
                    target.force_stop(&reason).await;
                }
                manager.finish_recovery(true);
            },
        );
    }

    fn finish_recovery(&self, graceful: bool) {
        self.reset();
        info!(graceful = graceful, "Graceful recovery finished");
        let _ = self
            .events
            .send(ReconnectEvent::RecoveryCompleted { graceful });
    }

    fn is_epoch(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn cancel_session_retries(&self, viewers: Vec<ViewerId>) {
        for viewer_id in viewers {
            self.supervisor.cancel(&TaskKey::SessionRetry(viewer_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::StreamState;
    use crate::snapshot::MemorySnapshotStore;
    use crate::testing::FailingSnapshotStore;
    use crate::types::RoomId;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::time::Instant;

    struct MockTarget {
        succeed: AtomicBool,
        reestablish_delay: Mutex<Duration>,
        attempts: AtomicUsize,
        reopened: Mutex<Vec<ViewerId>>,
        abandoned: Mutex<Vec<ViewerId>>,
        announced: AtomicUsize,
        stopped_at: Mutex<Option<Instant>>,
        stop_reason: Mutex<Option<String>>,
    }

    impl MockTarget {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed: AtomicBool::new(succeed),
                reestablish_delay: Mutex::new(Duration::ZERO),
                attempts: AtomicUsize::new(0),
                reopened: Mutex::new(Vec::new()),
                abandoned: Mutex::new(Vec::new()),
                announced: AtomicUsize::new(0),
                stopped_at: Mutex::new(None),
                stop_reason: Mutex::new(None),
            })
        }

        fn outcome(&self) -> Result<()> {
            if self.succeed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::SignalingUnavailable("offline".to_string()))
            }
        }
    }

    #[async_trait]
    impl RecoveryTarget for MockTarget {
        async fn reestablish(&self) -> Result<RecreateReport> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.reestablish_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.outcome().map(|()| RecreateReport {
                recreated: 2,
                failed: Vec::new(),
            })
        }

        async fn reopen_session(&self, viewer_id: &ViewerId) -> Result<bool> {
            self.reopened.lock().push(viewer_id.clone());
            self.outcome().map(|()| true)
        }

        async fn abandon_session(&self, viewer_id: &ViewerId, _reason: &str) {
            self.abandoned.lock().push(viewer_id.clone());
        }

        fn recovery_snapshot(&self, attempts: u32, reason: &str) -> Option<RecoverySnapshot> {
            Some(RecoverySnapshot {
                room_id: RoomId::from("room1"),
                broadcaster_id: "host".to_string(),
                viewers: vec![ViewerId::from("v1")],
                lifecycle_state: StreamState::Live,
                reconnect_attempts: attempts,
                reason: reason.to_string(),
                created_at: Utc::now(),
            })
        }

        async fn announce_recovery(&self, _snapshot: &RecoverySnapshot) {
            self.announced.fetch_add(1, Ordering::SeqCst);
        }

        async fn force_stop(&self, reason: &str) {
            *self.stopped_at.lock() = Some(Instant::now());
            *self.stop_reason.lock() = Some(reason.to_string());
        }
    }

    fn manager(store: Arc<dyn SnapshotStore>) -> Arc<ReconnectionManager> {
        Arc::new(ReconnectionManager::new(
            ReconnectConfig::default(),
            Arc::new(ResourceSupervisor::new()),
            store,
        ))
    }

    fn weak(target: &Arc<MockTarget>) -> Weak<dyn RecoveryTarget> {
        let target: Arc<dyn RecoveryTarget> = Arc::clone(target) as Arc<dyn RecoveryTarget>;
        Arc::downgrade(&target)
    }

    fn session(viewer: &str) -> FailureScope {
        FailureScope::Session(ViewerId::from(viewer))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_law_and_graceful_recovery() {
        let store = Arc::new(MemorySnapshotStore::new());
        let manager = manager(Arc::clone(&store) as Arc<dyn SnapshotStore>);
        let target = MockTarget::new(false);
        let mut events = manager.subscribe();
        let start = Instant::now();

        manager.on_failure(weak(&target), FailureScope::Signaling, "channel closed");
        tokio::time::sleep(Duration::from_secs(32)).await;

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ReconnectEvent::Scheduled { delay, .. } = event {
                delays.push(delay);
            }
        }
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
        assert_eq!(target.attempts.load(Ordering::SeqCst), 5);
        assert!(manager.is_recovering());
        assert_eq!(store.current().unwrap().reconnect_attempts, 5);
        assert_eq!(target.announced.load(Ordering::SeqCst), 1);
        assert!(target.stopped_at.lock().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stopped = target.stopped_at.lock().unwrap() - start;
        assert!(stopped >= Duration::from_secs(33) && stopped < Duration::from_millis(33_100));
        assert!(target
            .stop_reason
            .lock()
            .as_deref()
            .unwrap()
            .starts_with("Recovery exhausted after 5 reconnection attempts"));
        assert_eq!(manager.attempts(), 0);
        assert!(!manager.is_recovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let manager = manager(Arc::new(MemorySnapshotStore::new()));
        let target = MockTarget::new(false);

        manager.on_failure(weak(&target), FailureScope::Signaling, "channel closed");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(manager.attempts(), 2);

        target.succeed.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.attempts(), 0);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 2);

        assert_eq!(
            manager.on_failure(weak(&target), FailureScope::Signaling, "again"),
            FailureDisposition::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_coalesce_while_pending() {
        let manager = manager(Arc::new(MemorySnapshotStore::new()));
        let target = MockTarget::new(true);

        manager.on_failure(weak(&target), FailureScope::Signaling, "channel closed");
        assert_eq!(
            manager.on_failure(weak(&target), FailureScope::Signaling, "still closed"),
            FailureDisposition::Coalesced
        );
        assert_eq!(
            manager.on_failure(weak(&target), session("v1"), "transport failed"),
            FailureDisposition::Coalesced
        );

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
        assert!(target.reopened.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_retry_is_scoped_to_the_viewer() {
        let manager = manager(Arc::new(MemorySnapshotStore::new()));
        let target = MockTarget::new(true);

        manager.on_failure(weak(&target), session("v1"), "transport failed");
        assert_eq!(
            manager.on_failure(weak(&target), session("v1"), "transport failed"),
            FailureDisposition::Coalesced
        );
        assert_eq!(
            manager.on_failure(weak(&target), session("v2"), "transport failed"),
            FailureDisposition::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let mut reopened = target.reopened.lock().clone();
        reopened.sort();
        assert_eq!(reopened, vec![ViewerId::from("v1"), ViewerId::from("v2")]);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(manager.attempts(), 0);

        // Spent until the session connects again
        assert_eq!(manager.attempts_for(&ViewerId::from("v1")), 1);
        assert!(manager.clear_session(&ViewerId::from("v1")));
        assert_eq!(manager.attempts_for(&ViewerId::from("v1")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_session_budget_drops_only_that_viewer() {
        let store = Arc::new(MemorySnapshotStore::new());
        let manager = manager(Arc::clone(&store) as Arc<dyn SnapshotStore>);
        let target = MockTarget::new(false);
        let mut events = manager.subscribe();

        manager.on_failure(weak(&target), session("v1"), "transport failed");
        tokio::time::sleep(Duration::from_secs(32)).await;

        assert_eq!(target.reopened.lock().len(), 5);
        assert_eq!(*target.abandoned.lock(), vec![ViewerId::from("v1")]);
        assert_eq!(manager.attempts_for(&ViewerId::from("v1")), 0);
        assert!(!manager.is_recovering());
        assert!(store.current().is_none());
        assert!(target.stopped_at.lock().is_none());
        assert_eq!(target.announced.load(Ordering::SeqCst), 0);

        let mut abandoned = false;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ReconnectEvent::RecoveryStarted { .. }));
            abandoned |= matches!(
                event,
                ReconnectEvent::SessionAbandoned { ref viewer_id, attempts: 5 } if viewer_id.as_str() == "v1"
            );
        }
        assert!(abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_strands_in_flight_attempt() {
        let supervisor = Arc::new(ResourceSupervisor::new());
        let manager = Arc::new(ReconnectionManager::new(
            ReconnectConfig::default(),
            Arc::clone(&supervisor),
            Arc::new(MemorySnapshotStore::new()),
        ));
        let target = MockTarget::new(false);
        *target.reestablish_delay.lock() = Duration::from_secs(5);
        let mut events = manager.subscribe();

        manager.on_failure(weak(&target), FailureScope::Signaling, "channel closed");
        // Attempt 1 starts at 1s and is still waiting on the channel at 2s.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.active_count(), 0);

        supervisor.cancel_all();
        manager.reset();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.attempts(), 0);
        assert_eq!(supervisor.active_count(), 0);
        assert!(target.stopped_at.lock().is_none());

        let mut after_first = Vec::new();
        while let Ok(event) = events.try_recv() {
            after_first.push(event);
        }
        assert_eq!(
            after_first,
            vec![ReconnectEvent::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_failure_stops_without_grace() {
        let store = Arc::new(FailingSnapshotStore::new());
        let manager = manager(Arc::clone(&store) as Arc<dyn SnapshotStore>);
        let target = MockTarget::new(false);
        let start = Instant::now();

        manager.on_failure(weak(&target), FailureScope::Signaling, "channel closed");
        tokio::time::sleep(Duration::from_millis(31_500)).await;

        assert_eq!(store.attempts(), 1);
        assert_eq!(target.announced.load(Ordering::SeqCst), 0);
        let stopped = target.stopped_at.lock().unwrap() - start;
        assert!(stopped >= Duration::from_secs(31) && stopped < Duration::from_millis(31_100));
    }
}
