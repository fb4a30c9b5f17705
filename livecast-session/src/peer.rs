//! Per-viewer peer session
//!
//! This module handles:
//! - The session state machine (`pending → offerSent → answered → connected → …`)
//! - Offer dispatch with duplicate/terminal/no-media validation
//! - Matching answers to the pending offer
//! - Queue-then-flush ordering of remote ICE candidates
//!
//! Negotiation steps of one session are serialized by an async mutex, so
//! candidates are never applied before the remote description and always in
//! arrival order. Different sessions never share a lock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, OfferRejection, Result};
use crate::lifecycle::StateChange;
use crate::signaling::{SignalMessage, SignalingChannel};
use crate::transport::{IceCandidate, PeerTransport, SessionDescription, TransportState};
use crate::types::{OfferId, RoomId, ViewerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Pending,
    OfferSent,
    Answered,
    Connected,
    Degraded,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// `closed` is final; `disconnected`, `failed` and `closed` are reachable
    /// from every other state. A disconnected transport may come back.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Closed, _) => false,
            (_, Self::Closed) => true,
            (Self::Failed, _) => false,
            (Self::Disconnected, Self::Disconnected) => false,
            (_, Self::Disconnected | Self::Failed) => true,
            (Self::Pending, Self::OfferSent)
            | (Self::OfferSent, Self::Answered)
            | (Self::Answered | Self::Disconnected | Self::Degraded, Self::Connected)
            | (Self::Connected, Self::Degraded) => true,
            _ => false,
        }
    }

    /// No further negotiation is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Transport is up (possibly with poor quality)
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::OfferSent => "offerSent",
            Self::Answered => "answered",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State change of one viewer's session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub viewer_id: ViewerId,
    pub change: StateChange<SessionState>,
}

/// An offer waiting for its answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOffer {
    pub offer_id: OfferId,
    pub sent_at: Instant,
    pub sent_at_wall: DateTime<Utc>,
}

/// Outcome of an offer-ack timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferTimeout {
    /// The offer was answered or superseded before the timer fired
    Stale,
    /// The offer expired; `failures` counts expiries so far
    Expired { failures: u32 },
}

/// Where a remote candidate went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Queued,
    Applied,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub viewer_id: ViewerId,
    pub state: SessionState,
    pub offer_attempts: u32,
    pub pending_offer_id: Option<OfferId>,
    pub pending_offer_sent_at: Option<DateTime<Utc>>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub queued_candidates: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Negotiation {
    offer_attempts: u32,
    pending_offer: Option<PendingOffer>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    ice_queue: VecDeque<IceCandidate>,
}

pub struct PeerSession {
    viewer_id: ViewerId,
    room_id: RoomId,
    transport: Arc<dyn PeerTransport>,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    negotiation: Mutex<Negotiation>,
    events: broadcast::Sender<SessionEvent>,
}

impl PeerSession {
    pub fn new(
        viewer_id: ViewerId,
        room_id: RoomId,
        transport: Arc<dyn PeerTransport>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            viewer_id,
            room_id,
            transport,
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Pending),
            negotiation: Mutex::new(Negotiation::default()),
            events,
        }
    }

    #[must_use]
    pub const fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn info(&self) -> SessionInfo {
        let negotiation = self.negotiation.lock().await;
        SessionInfo {
            viewer_id: self.viewer_id.clone(),
            state: self.state(),
            offer_attempts: negotiation.offer_attempts,
            pending_offer_id: negotiation
                .pending_offer
                .as_ref()
                .map(|p| p.offer_id.clone()),
            pending_offer_sent_at: negotiation.pending_offer.as_ref().map(|p| p.sent_at_wall),
            local_description: negotiation.local_description.clone(),
            remote_description: negotiation.remote_description.clone(),
            queued_candidates: negotiation.ice_queue.len(),
            created_at: self.created_at,
        }
    }

    /// Whether an unanswered offer younger than `window` is outstanding
    pub async fn offer_in_flight(&self, window: Duration) -> bool {
        self.negotiation
            .lock()
            .await
            .pending_offer
            .as_ref()
            .is_some_and(|pending| pending.sent_at.elapsed() < window)
    }

    /// Generate a local description and dispatch it as a new offer
    ///
    /// Refused while a previous offer is younger than `duplicate_window`, once
    /// the session is failed/closed, or without local media. A signaling
    /// outage does not fail the call: the message is dropped and the ack
    /// timer drives the retry.
    pub async fn send_offer(
        &self,
        signaling: &dyn SignalingChannel,
        duplicate_window: Duration,
        media_available: bool,
    ) -> Result<OfferId> {
        let mut negotiation = self.negotiation.lock().await;

        let state = self.state();
        if state.is_terminal() {
            return Err(Error::OfferRejected(OfferRejection::SessionTerminated));
        }
        if let Some(pending) = &negotiation.pending_offer {
            if pending.sent_at.elapsed() < duplicate_window {
                return Err(Error::OfferRejected(OfferRejection::DuplicateInFlight));
            }
        }
        if !media_available {
            return Err(Error::OfferRejected(OfferRejection::NoLocalMedia));
        }
        if !matches!(state, SessionState::Pending | SessionState::OfferSent) {
            return Err(Error::Negotiation(format!(
                "cannot offer in state {state}"
            )));
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;

        let offer_id = OfferId::generate();
        let sent_at_wall = Utc::now();
        negotiation.local_description = Some(offer.clone());
        negotiation.pending_offer = Some(PendingOffer {
            offer_id: offer_id.clone(),
            sent_at: Instant::now(),
            sent_at_wall,
        });
        if state == SessionState::Pending {
            self.set_state(SessionState::OfferSent)?;
        }

        let message = SignalMessage::Offer {
            room_id: self.room_id.clone(),
            offer,
            target_viewer_id: self.viewer_id.clone(),
            offer_id: offer_id.clone(),
            timestamp: sent_at_wall,
        };
        match signaling.send(message).await {
            Ok(()) => debug!(
                viewer_id = %self.viewer_id,
                offer_id = %offer_id,
                attempt = negotiation.offer_attempts + 1,
                "Offer sent"
            ),
            Err(e) => warn!(
                viewer_id = %self.viewer_id,
                offer_id = %offer_id,
                error = %e,
                "Offer dropped, waiting for ack timeout"
            ),
        }

        Ok(offer_id)
    }

    /// Apply an answer for the pending offer and flush queued candidates
    ///
    /// An answer without `offer_id` is matched to whatever offer is pending.
    /// Returns how many queued candidates were flushed.
    pub async fn handle_answer(
        &self,
        offer_id: Option<&OfferId>,
        answer: SessionDescription,
    ) -> Result<usize> {
        let mut negotiation = self.negotiation.lock().await;

        let matches = match (&negotiation.pending_offer, offer_id) {
            (Some(pending), Some(offer_id)) => pending.offer_id == *offer_id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches || self.state() != SessionState::OfferSent {
            return Err(Error::Negotiation(format!(
                "answer from {} does not match a pending offer",
                self.viewer_id
            )));
        }

        self.transport
            .set_remote_description(answer.clone())
            .await
            .map_err(|e| Error::Negotiation(format!("failed to apply answer: {e}")))?;

        negotiation.remote_description = Some(answer);
        negotiation.pending_offer = None;
        self.set_state(SessionState::Answered)?;

        let mut flushed = 0;
        while let Some(candidate) = negotiation.ice_queue.pop_front() {
            self.apply_candidate(candidate).await;
            flushed += 1;
        }

        info!(
            viewer_id = %self.viewer_id,
            flushed_candidates = flushed,
            "Answer applied"
        );
        Ok(flushed)
    }

    /// Queue a remote candidate until the remote description is set, then apply directly
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        let mut negotiation = self.negotiation.lock().await;

        if self.state() == SessionState::Closed {
            return Err(Error::Negotiation(format!(
                "candidate for closed session {}",
                self.viewer_id
            )));
        }

        if negotiation.remote_description.is_none() {
            negotiation.ice_queue.push_back(candidate);
            debug!(
                viewer_id = %self.viewer_id,
                queued = negotiation.ice_queue.len(),
                "Candidate queued until remote description"
            );
            return Ok(CandidateDisposition::Queued);
        }

        self.apply_candidate(candidate).await;
        Ok(CandidateDisposition::Applied)
    }

    /// Record the expiry of `offer_id`; stale timers are ignored
    pub async fn expire_offer(&self, offer_id: &OfferId) -> OfferTimeout {
        let mut negotiation = self.negotiation.lock().await;

        let is_current = negotiation
            .pending_offer
            .as_ref()
            .is_some_and(|pending| pending.offer_id == *offer_id);
        if !is_current || self.state().is_terminal() {
            return OfferTimeout::Stale;
        }

        negotiation.pending_offer = None;
        negotiation.offer_attempts += 1;
        OfferTimeout::Expired {
            failures: negotiation.offer_attempts,
        }
    }

    /// Follow a transport connection-state report
    pub fn on_transport_state(&self, state: TransportState) -> Result<Option<StateChange<SessionState>>> {
        let next = match state {
            TransportState::Connected => match self.state() {
                SessionState::Answered | SessionState::Disconnected => SessionState::Connected,
                _ => return Ok(None),
            },
            TransportState::Disconnected => SessionState::Disconnected,
            TransportState::Failed => SessionState::Failed,
            TransportState::Closed => SessionState::Closed,
            TransportState::New | TransportState::Connecting => return Ok(None),
        };
        if self.state() == next {
            return Ok(None);
        }
        self.set_state(next).map(Some)
    }

    /// Move between `connected` and `degraded` on a health verdict
    pub fn apply_health_verdict(&self, poor: bool) -> Option<StateChange<SessionState>> {
        let next = match (self.state(), poor) {
            (SessionState::Connected, true) => SessionState::Degraded,
            (SessionState::Degraded, false) => SessionState::Connected,
            _ => return None,
        };
        self.set_state(next).ok()
    }

    /// Close the session and its transport; idempotent
    pub async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        if let Err(e) = self.set_state(SessionState::Closed) {
            debug!(viewer_id = %self.viewer_id, error = %e, "Session already closed");
            return;
        }

        {
            let mut negotiation = self.negotiation.lock().await;
            negotiation.pending_offer = None;
            negotiation.ice_queue.clear();
        }

        if let Err(e) = self.transport.close().await {
            warn!(viewer_id = %self.viewer_id, error = %e, "Failed to close transport");
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(viewer_id = %self.viewer_id, error = %e, "Failed to add ICE candidate");
        }
    }

    fn set_state(&self, next: SessionState) -> Result<StateChange<SessionState>> {
        let change = {
            let mut state = self.state.write();
            let from = *state;
            if !from.can_transition_to(next) {
                return Err(Error::IllegalSessionTransition {
                    viewer_id: self.viewer_id.clone(),
                    from,
                    to: next,
                });
            }
            *state = next;
            StateChange {
                old: from,
                new: next,
                at: Utc::now(),
                reason: None,
            }
        };

        debug!(
            viewer_id = %self.viewer_id,
            old_state = %change.old,
            new_state = %change.new,
            "Session state changed"
        );
        let _ = self.events.send(SessionEvent {
            viewer_id: self.viewer_id.clone(),
            change: change.clone(),
        });
        Ok(change)
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        debug!(viewer_id = %self.viewer_id, state = %self.state.read(), "PeerSession dropped");
    }
}
