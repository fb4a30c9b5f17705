//! Stream lifecycle state machine
//!
//! ```text
//! idle          -> starting
//! starting      -> live, error
//! live          -> screenSharing, recording, stopping, error
//! screenSharing -> live, recording, stopping, error
//! recording     -> live, screenSharing, stopping, error
//! stopping      -> idle, error
//! error         -> idle
//! ```
//!
//! A room exists for as long as the state is not `idle`. Every accepted
//! transition is published to subscribers in order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::RoomId;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    Idle,
    Starting,
    Live,
    ScreenSharing,
    Recording,
    Stopping,
    Error,
}

impl StreamState {
    /// States reachable from `self` in one step
    #[must_use]
    pub const fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Idle => &[Self::Starting],
            Self::Starting => &[Self::Live, Self::Error],
            Self::Live => &[Self::ScreenSharing, Self::Recording, Self::Stopping, Self::Error],
            Self::ScreenSharing => &[Self::Live, Self::Recording, Self::Stopping, Self::Error],
            Self::Recording => &[Self::Live, Self::ScreenSharing, Self::Stopping, Self::Error],
            Self::Stopping => &[Self::Idle, Self::Error],
            Self::Error => &[Self::Idle],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Broadcasting states: viewers may join and the room may be stopped
    #[must_use]
    pub const fn is_broadcasting(self) -> bool {
        matches!(self, Self::Live | Self::ScreenSharing | Self::Recording)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Live => "live",
            Self::ScreenSharing => "screenSharing",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One accepted transition of a state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange<S> {
    pub old: S,
    pub new: S,
    pub at: DateTime<Utc>,
    /// Human-readable reason, always present on transitions into `error`
    pub reason: Option<String>,
}

/// The active broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub broadcaster_id: String,
    pub opened_at: DateTime<Utc>,
    /// Set on `starting -> live`
    pub live_since: Option<DateTime<Utc>>,
}

struct LifecycleInner {
    state: StreamState,
    room: Option<Room>,
    last_error: Option<String>,
}

pub struct StreamLifecycle {
    inner: Mutex<LifecycleInner>,
    events: broadcast::Sender<StateChange<StreamState>>,
}

impl StreamLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(LifecycleInner {
                state: StreamState::Idle,
                room: None,
                last_error: None,
            }),
            events,
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn can_transition(&self, to: StreamState) -> bool {
        self.state().can_transition_to(to)
    }

    /// Current room, `None` while idle
    #[must_use]
    pub fn room(&self) -> Option<Room> {
        self.inner.lock().room.clone()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.lock().room.as_ref().map(|room| room.room_id.clone())
    }

    /// Reason attached to the most recent transition into `error`
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    #[must_use]
    pub fn accepts_viewers(&self) -> bool {
        self.state().is_broadcasting()
    }

    /// Ordered stream of accepted transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange<StreamState>> {
        self.events.subscribe()
    }

    /// `idle -> starting`, opening the room
    pub fn begin(&self, room_id: RoomId, broadcaster_id: impl Into<String>) -> Result<StateChange<StreamState>> {
        let mut inner = self.inner.lock();
        let change = Self::apply(&mut inner, StreamState::Starting, None)?;
        inner.room = Some(Room {
            room_id,
            broadcaster_id: broadcaster_id.into(),
            opened_at: change.at,
            live_since: None,
        });
        drop(inner);
        self.publish(change.clone());
        Ok(change)
    }

    pub fn transition(&self, to: StreamState) -> Result<StateChange<StreamState>> {
        self.transition_with_reason(to, None)
    }

    pub fn transition_with_reason(
        &self,
        to: StreamState,
        reason: Option<String>,
    ) -> Result<StateChange<StreamState>> {
        let mut inner = self.inner.lock();
        let change = Self::apply(&mut inner, to, reason)?;
        drop(inner);
        self.publish(change.clone());
        Ok(change)
    }

    /// Transition into `error` with an operator-facing reason
    pub fn fail(&self, reason: impl Into<String>) -> Result<StateChange<StreamState>> {
        self.transition_with_reason(StreamState::Error, Some(reason.into()))
    }

    /// Walk the legal path from the current state back to `idle`
    ///
    /// Broadcasting states go through `stopping`, `starting` goes through
    /// `error`. Returns the transitions taken, empty when already idle.
    pub fn force_idle(&self, reason: &str) -> Vec<StateChange<StreamState>> {
        let mut changes = Vec::new();
        loop {
            let next = match self.state() {
                StreamState::Idle => break,
                StreamState::Live | StreamState::ScreenSharing | StreamState::Recording => {
                    StreamState::Stopping
                }
                StreamState::Starting => StreamState::Error,
                StreamState::Stopping | StreamState::Error => StreamState::Idle,
            };
            let reason = (next == StreamState::Error).then(|| reason.to_string());
            match self.transition_with_reason(next, reason) {
                Ok(change) => changes.push(change),
                Err(e) => {
                    // Another caller moved the machine concurrently; re-read and continue.
                    warn!(error = %e, "Forced stop raced with another transition");
                }
            }
        }
        changes
    }

    fn apply(
        inner: &mut LifecycleInner,
        to: StreamState,
        reason: Option<String>,
    ) -> Result<StateChange<StreamState>> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let at = Utc::now();
        inner.state = to;
        match to {
            StreamState::Idle => inner.room = None,
            StreamState::Live if from == StreamState::Starting => {
                if let Some(room) = inner.room.as_mut() {
                    room.live_since = Some(at);
                }
            }
            StreamState::Error => inner.last_error.clone_from(&reason),
            _ => {}
        }

        Ok(StateChange {
            old: from,
            new: to,
            at,
            reason,
        })
    }

    fn publish(&self, change: StateChange<StreamState>) {
        info!(
            old_state = %change.old,
            new_state = %change.new,
            reason = change.reason.as_deref().unwrap_or(""),
            "Stream state changed"
        );
        // No subscribers is fine
        let _ = self.events.send(change);
    }
}

impl Default for StreamLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
