//! Viewer-side mirror of a peer session
//!
//! Consumes the broadcaster's offer, answers it, exchanges ICE with the same
//! queue-then-flush ordering as the broadcaster side, and runs the mic
//! sub-protocol. A fresh offer (new offer id) starts a fresh transport;
//! once the session is `closed` no offer is accepted.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, OfferRejection, Result};
use crate::peer::SessionState;
use crate::signaling::{SignalEnvelope, SignalEvent, SignalMessage, SignalingChannel};
use crate::transport::{
    IceCandidate, LocalAudio, PeerTransport, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::types::{OfferId, RoomId, UserInfo, ViewerId};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicState {
    Idle,
    Requested,
    Approved,
    Rejected,
    Muted,
}

impl fmt::Display for MicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Muted => "muted",
        };
        f.write_str(name)
    }
}

/// What the viewer UI observes
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    StreamStarted,
    StreamStopped { reason: Option<String> },
    Answered { offer_id: OfferId },
    StateChanged { old: SessionState, new: SessionState },
    MicChanged(MicState),
    Chat { user: UserInfo, message: String, admin: bool },
    RecoveryNotice,
}

#[derive(Default)]
struct ViewerNegotiation {
    transport: Option<Arc<dyn PeerTransport>>,
    current_offer: Option<OfferId>,
    remote_set: bool,
    ice_queue: VecDeque<IceCandidate>,
}

pub struct ViewerSession {
    viewer_id: ViewerId,
    room_id: RoomId,
    user_info: UserInfo,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn TransportFactory>,
    audio: Arc<dyn LocalAudio>,
    negotiation: Mutex<ViewerNegotiation>,
    state: RwLock<SessionState>,
    mic: RwLock<MicState>,
    events: broadcast::Sender<ViewerEvent>,
}

impl ViewerSession {
    pub fn new(
        room_id: RoomId,
        user_info: UserInfo,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
        audio: Arc<dyn LocalAudio>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            viewer_id: signaling.connection_id(),
            room_id,
            user_info,
            signaling,
            factory,
            audio,
            negotiation: Mutex::new(ViewerNegotiation::default()),
            state: RwLock::new(SessionState::Pending),
            mic: RwLock::new(MicState::Idle),
            events,
        })
    }

    #[must_use]
    pub const fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub fn mic_state(&self) -> MicState {
        *self.mic.read()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ViewerEvent> {
        self.events.subscribe()
    }

    /// Connect to the room and announce this viewer to the broadcaster
    pub async fn join(&self) -> Result<()> {
        self.signaling.connect(&self.room_id).await?;
        self.signaling
            .send(SignalMessage::ViewerJoin {
                room_id: self.room_id.clone(),
                user_info: Some(self.user_info.clone()),
            })
            .await
    }

    /// Process inbound signaling until the channel closes
    pub async fn run(self: Arc<Self>) {
        let Some(mut events) = self.signaling.take_events() else {
            warn!(viewer_id = %self.viewer_id, "Signaling events already taken");
            return;
        };
        while let Some(event) = events.recv().await {
            match event {
                SignalEvent::Message(envelope) => {
                    if let Err(e) = self.handle(envelope).await {
                        warn!(viewer_id = %self.viewer_id, error = %e, "Failed to handle signal");
                    }
                }
                SignalEvent::Connected => debug!(viewer_id = %self.viewer_id, "Signaling connected"),
                SignalEvent::Disconnected { reason } => {
                    warn!(viewer_id = %self.viewer_id, reason = %reason, "Signaling disconnected");
                }
            }
        }
    }

    pub async fn handle(self: &Arc<Self>, envelope: SignalEnvelope) -> Result<()> {
        match envelope.message {
            SignalMessage::Offer {
                offer, offer_id, ..
            } => self.handle_offer(offer_id, offer).await,
            SignalMessage::IceCandidate { candidate, .. } => self.add_remote_candidate(candidate).await,
            SignalMessage::MicRequestResponse { approved, .. } => self.on_mic_response(approved).await,
            SignalMessage::MuteUserMic { .. } => {
                self.mute();
                Ok(())
            }
            SignalMessage::StreamStarted { .. } => {
                let _ = self.events.send(ViewerEvent::StreamStarted);
                Ok(())
            }
            SignalMessage::StreamStopped { reason, .. } => {
                info!(viewer_id = %self.viewer_id, reason = ?reason, "Stream stopped");
                self.close_transport().await;
                self.set_state(SessionState::Closed)?;
                let _ = self.events.send(ViewerEvent::StreamStopped { reason });
                Ok(())
            }
            SignalMessage::RecoveryAttempt { .. } => {
                let _ = self.events.send(ViewerEvent::RecoveryNotice);
                Ok(())
            }
            SignalMessage::ChatMessage { message, user, .. } => {
                let _ = self.events.send(ViewerEvent::Chat {
                    user,
                    message,
                    admin: false,
                });
                Ok(())
            }
            SignalMessage::AdminChat { message, user, .. } => {
                let _ = self.events.send(ViewerEvent::Chat {
                    user,
                    message,
                    admin: true,
                });
                Ok(())
            }
            SignalMessage::ServerError { message } => Err(Error::SignalingUnavailable(message)),
            other => {
                debug!(viewer_id = %self.viewer_id, event_type = other.event_type(), "Ignoring signal");
                Ok(())
            }
        }
    }

    /// Answer an offer; a repeated offer id is ignored, a closed session refuses it
    pub async fn handle_offer(self: &Arc<Self>, offer_id: OfferId, offer: SessionDescription) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        if self.state() == SessionState::Closed {
            debug!(viewer_id = %self.viewer_id, offer_id = %offer_id, "Offer after close refused");
            return Err(Error::OfferRejected(OfferRejection::SessionTerminated));
        }
        if negotiation.current_offer.as_ref() == Some(&offer_id) {
            debug!(viewer_id = %self.viewer_id, offer_id = %offer_id, "Duplicate offer ignored");
            return Ok(());
        }

        if let Some(previous) = negotiation.transport.take() {
            if let Err(e) = previous.close().await {
                debug!(viewer_id = %self.viewer_id, error = %e, "Failed to close previous transport");
            }
        }
        negotiation.remote_set = false;
        negotiation.current_offer = Some(offer_id.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(&self.viewer_id, events_tx).await?;
        negotiation.transport = Some(Arc::clone(&transport));
        self.spawn_transport_pump(&transport, events_rx);

        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        negotiation.remote_set = true;

        while let Some(candidate) = negotiation.ice_queue.pop_front() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(viewer_id = %self.viewer_id, error = %e, "Failed to add ICE candidate");
            }
        }
        drop(negotiation);

        self.set_state(SessionState::Answered)?;
        self.signaling
            .send(SignalMessage::Answer {
                room_id: self.room_id.clone(),
                answer,
                target_viewer_id: None,
                offer_id: Some(offer_id.clone()),
                timestamp: Utc::now(),
            })
            .await?;
        info!(viewer_id = %self.viewer_id, offer_id = %offer_id, "Offer answered");
        let _ = self.events.send(ViewerEvent::Answered { offer_id });
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        if self.state() == SessionState::Closed {
            debug!(viewer_id = %self.viewer_id, "Candidate after close dropped");
            return Ok(());
        }
        match (&negotiation.transport, negotiation.remote_set) {
            (Some(transport), true) => transport.add_ice_candidate(candidate).await,
            _ => {
                negotiation.ice_queue.push_back(candidate);
                Ok(())
            }
        }
    }

    pub async fn request_mic(&self) -> Result<()> {
        if matches!(self.mic_state(), MicState::Requested | MicState::Approved) {
            return Ok(());
        }
        self.signaling
            .send(SignalMessage::MicRequest {
                room_id: self.room_id.clone(),
                user_info: self.user_info.clone(),
            })
            .await?;
        self.set_mic(MicState::Requested);
        Ok(())
    }

    pub async fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        self.signaling
            .send(SignalMessage::ChatMessage {
                room_id: self.room_id.clone(),
                message: message.into(),
                user: self.user_info.clone(),
            })
            .await
    }

    /// Close the transport and leave the room
    pub async fn leave(&self) {
        self.close_transport().await;
        let _ = self.set_state(SessionState::Closed);
        self.signaling.disconnect().await;
    }

    async fn on_mic_response(&self, approved: bool) -> Result<()> {
        if !approved {
            self.set_mic(MicState::Rejected);
            return Ok(());
        }
        self.audio.attach().await?;
        self.audio.set_enabled(true);
        self.set_mic(MicState::Approved);
        Ok(())
    }

    /// Disable the outbound audio track without renegotiating
    fn mute(&self) {
        self.audio.set_enabled(false);
        self.set_mic(MicState::Muted);
    }

    async fn close_transport(&self) {
        let mut negotiation = self.negotiation.lock().await;
        negotiation.remote_set = false;
        negotiation.ice_queue.clear();
        if let Some(transport) = negotiation.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(viewer_id = %self.viewer_id, error = %e, "Failed to close transport");
            }
        }
    }

    fn spawn_transport_pump(
        self: &Arc<Self>,
        transport: &Arc<dyn PeerTransport>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let session: Weak<Self> = Arc::downgrade(self);
        let transport = Arc::downgrade(transport);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                // Events of a replaced transport are stale.
                let is_current = {
                    let negotiation = session.negotiation.lock().await;
                    match (negotiation.transport.as_ref(), transport.upgrade()) {
                        (Some(current), Some(ours)) => Arc::ptr_eq(current, &ours),
                        _ => false,
                    }
                };
                if !is_current {
                    break;
                }
                session.on_transport_event(event).await;
            }
        });
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate { candidate, .. } => {
                let message = SignalMessage::IceCandidate {
                    room_id: self.room_id.clone(),
                    candidate,
                    target_viewer_id: None,
                };
                if let Err(e) = self.signaling.send(message).await {
                    debug!(viewer_id = %self.viewer_id, error = %e, "Local candidate dropped");
                }
            }
            TransportEvent::StateChanged { state, .. } => {
                let next = match state {
                    TransportState::Connected => SessionState::Connected,
                    TransportState::Disconnected => SessionState::Disconnected,
                    TransportState::Failed => SessionState::Failed,
                    TransportState::Closed => SessionState::Closed,
                    TransportState::New | TransportState::Connecting => return,
                };
                if let Err(e) = self.set_state(next) {
                    debug!(viewer_id = %self.viewer_id, error = %e, "Transport state ignored");
                }
            }
        }
    }

    fn set_state(&self, next: SessionState) -> Result<()> {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            if old == next {
                return Ok(());
            }
            if !viewer_can_transition(old, next) {
                return Err(Error::IllegalSessionTransition {
                    viewer_id: self.viewer_id.clone(),
                    from: old,
                    to: next,
                });
            }
            *state = next;
            old
        };
        debug!(viewer_id = %self.viewer_id, old_state = %old, new_state = %next, "Viewer state changed");
        let _ = self.events.send(ViewerEvent::StateChanged { old, new: next });
        Ok(())
    }

    fn set_mic(&self, next: MicState) {
        *self.mic.write() = next;
        info!(viewer_id = %self.viewer_id, mic = %next, "Mic state changed");
        let _ = self.events.send(ViewerEvent::MicChanged(next));
    }
}

/// The viewer never sends offers, so it skips `offerSent`: every accepted
/// offer lands on `answered`, including one that replaces a failed transport.
const fn viewer_can_transition(from: SessionState, to: SessionState) -> bool {
    match (from, to) {
        (SessionState::Closed, _) => false,
        (_, SessionState::Answered) => true,
        _ => from.can_transition_to(to),
    }
}
