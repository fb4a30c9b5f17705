//! Broadcaster context
//!
//! `BroadcastSession` owns every room-scoped component and is the only thing
//! an embedding application constructs. One inbound pump serializes signaling
//! messages, registry signals and state-machine notifications. It never waits
//! on a negotiation: each viewer's joins, answers, candidates and leave go to
//! that viewer's own lane and are applied there in arrival order. Room-scoped
//! timers and lanes live under the supervisor and are torn down with the room.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{ConnectionHealth, HealthMonitor, QualityTier};
use crate::lifecycle::{Room, StateChange, StreamLifecycle, StreamState};
use crate::logging;
use crate::mic::{MicRequest, MicRequestBook};
use crate::quality::QualityController;
use crate::reconnect::{FailureScope, ReconnectEvent, ReconnectionManager, RecoveryTarget};
use crate::registry::{RecreateReport, RegistrySignal, SessionRegistry};
use crate::signaling::{SignalEnvelope, SignalEvent, SignalMessage, SignalingChannel};
use crate::snapshot::{RecoverySnapshot, SnapshotStore};
use crate::supervisor::{ResourceSupervisor, TaskKey};
use crate::transport::{CaptureConstraints, CaptureSource, IceCandidate, SessionDescription, TransportFactory};
use crate::types::{OfferId, RoomId, UserInfo, ViewerId};

const OPERATOR_EVENT_CAPACITY: usize = 256;

/// What the operator UI observes
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorEvent {
    Lifecycle(StateChange<StreamState>),
    ViewerCount(usize),
    Quality { viewer_id: ViewerId, tier: QualityTier },
    ConstraintsAdjusted(CaptureConstraints),
    MicRequested(MicRequest),
    Chat {
        viewer_id: Option<ViewerId>,
        user: UserInfo,
        message: String,
    },
    ViewerDropped { viewer_id: ViewerId, reason: String },
    Recovery(ReconnectEvent),
}

/// External capabilities a broadcast runs on
pub struct BroadcastServices {
    pub signaling: Arc<dyn SignalingChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub capture: Arc<dyn CaptureSource>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

enum PumpInput {
    Signal(SignalEvent),
    Registry(RegistrySignal),
    Lifecycle(StateChange<StreamState>),
    ViewerCount(usize),
    Recovery(ReconnectEvent),
}

/// One step of a viewer's negotiation
enum Negotiation {
    Join(Option<UserInfo>),
    Answer {
        answer: SessionDescription,
        offer_id: Option<OfferId>,
    },
    Candidate(IceCandidate),
    Leave,
}

struct Lane {
    id: u64,
    work: mpsc::UnboundedSender<Negotiation>,
}

struct Shared {
    config: Config,
    broadcaster_id: String,
    lifecycle: Arc<StreamLifecycle>,
    registry: Arc<SessionRegistry>,
    health: HealthMonitor,
    quality: QualityController,
    reconnect: Arc<ReconnectionManager>,
    mic: MicRequestBook,
    supervisor: Arc<ResourceSupervisor>,
    signaling: Arc<dyn SignalingChannel>,
    capture: Arc<dyn CaptureSource>,
    snapshots: Arc<dyn SnapshotStore>,
    room_created: watch::Sender<Option<RoomId>>,
    operator: broadcast::Sender<OperatorEvent>,
    pump: CancellationToken,
    lanes: Mutex<HashMap<ViewerId, Lane>>,
    next_lane: AtomicU64,
    teardown: tokio::sync::Mutex<()>,
    last_stop_reason: Mutex<Option<String>>,
}

/// The broadcaster side of one room at a time
#[derive(Clone)]
pub struct BroadcastSession {
    shared: Arc<Shared>,
}

impl BroadcastSession {
    /// Build the context and start its inbound pump
    ///
    /// Must be called inside a Tokio runtime. Fails if the signaling
    /// channel's event stream was already taken by someone else.
    pub fn new(
        config: Config,
        broadcaster_id: impl Into<String>,
        services: BroadcastServices,
    ) -> Result<Self> {
        let signal_events = services.signaling.take_events().ok_or_else(|| {
            Error::SignalingUnavailable("signaling event stream already taken".to_string())
        })?;

        let supervisor = Arc::new(ResourceSupervisor::new());
        let lifecycle = Arc::new(StreamLifecycle::new());
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            Arc::clone(&lifecycle),
            services.transports,
            Arc::clone(&services.signaling),
            Arc::clone(&services.capture),
            Arc::clone(&supervisor),
            signals_tx,
        ));
        let reconnect = Arc::new(ReconnectionManager::new(
            config.reconnect.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&services.snapshots),
        ));
        let (room_created, _) = watch::channel(None);
        let (operator, _) = broadcast::channel(OPERATOR_EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            health: HealthMonitor::new(config.health.clone()),
            quality: QualityController::new(config.quality.clone(), Arc::clone(&services.capture)),
            config,
            broadcaster_id: broadcaster_id.into(),
            lifecycle,
            registry,
            reconnect,
            mic: MicRequestBook::new(),
            supervisor,
            signaling: services.signaling,
            capture: services.capture,
            snapshots: services.snapshots,
            room_created,
            operator,
            pump: CancellationToken::new(),
            lanes: Mutex::new(HashMap::new()),
            next_lane: AtomicU64::new(0),
            teardown: tokio::sync::Mutex::new(()),
            last_stop_reason: Mutex::new(None),
        });
        Shared::spawn_pump(&shared, signal_events, signals_rx);

        Ok(Self { shared })
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.lifecycle.state()
    }

    #[must_use]
    pub fn room(&self) -> Option<Room> {
        self.shared.lifecycle.room()
    }

    /// Reason of the last `error` transition
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.lifecycle.last_error()
    }

    /// Reason the room was last torn down
    #[must_use]
    pub fn last_stop_reason(&self) -> Option<String> {
        self.shared.last_stop_reason.lock().clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.shared.registry.viewer_count()
    }

    #[must_use]
    pub fn subscribe_viewer_count(&self) -> watch::Receiver<usize> {
        self.shared.registry.subscribe_viewer_count()
    }

    #[must_use]
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<StateChange<StreamState>> {
        self.shared.lifecycle.subscribe()
    }

    #[must_use]
    pub fn subscribe_recovery(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.shared.reconnect.subscribe()
    }

    #[must_use]
    pub fn subscribe_operator_events(&self) -> broadcast::Receiver<OperatorEvent> {
        self.shared.operator.subscribe()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect.attempts()
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.shared.reconnect.is_recovering()
    }

    /// Timers and tickers still pending for the room
    #[must_use]
    pub fn active_timers(&self) -> usize {
        self.shared.supervisor.active_count()
    }

    /// Retries spent on the viewer's session, or the room's while signaling is down
    #[must_use]
    pub fn retry_attempts(&self, viewer_id: &ViewerId) -> u32 {
        self.shared.reconnect.attempts_for(viewer_id)
    }

    /// Health of one viewer, with the retries spent on its behalf
    #[must_use]
    pub fn connection_health(&self, viewer_id: &ViewerId) -> Option<ConnectionHealth> {
        self.shared.health.health(viewer_id).map(|mut health| {
            health.reconnect_attempts = self.shared.reconnect.attempts_for(viewer_id);
            health
        })
    }

    #[must_use]
    pub fn pending_mic_requests(&self) -> Vec<MicRequest> {
        self.shared.mic.pending()
    }

    /// Open a room and go live
    ///
    /// Requires `idle` (an `error` left behind by a failed start is
    /// acknowledged first). Without local media the lifecycle moves to
    /// `error` and no retry is attempted.
    pub async fn start_broadcast(&self, room_id: Option<RoomId>) -> Result<RoomId> {
        let shared = &self.shared;
        if shared.lifecycle.state() == StreamState::Error {
            shared.lifecycle.transition(StreamState::Idle)?;
        }

        let room_id = room_id.unwrap_or_else(RoomId::generate);
        shared.lifecycle.begin(room_id.clone(), shared.broadcaster_id.clone())?;
        shared.last_stop_reason.lock().take();

        if !shared.capture.is_available() {
            let reason = "local media source is unavailable".to_string();
            error!(room_id = %room_id, "Cannot start broadcast: {reason}");
            shared.lifecycle.fail(reason.clone())?;
            return Err(Error::CaptureUnavailable(reason));
        }

        if let Err(e) = shared
            .bootstrap_room(&room_id)
            .instrument(logging::room_span(&room_id))
            .await
        {
            error!(room_id = %room_id, error = %e, "Room bootstrap failed");
            shared.signaling.disconnect().await;
            shared.lifecycle.fail(e.to_string())?;
            return Err(e);
        }

        shared.lifecycle.transition(StreamState::Live)?;
        shared
            .send_or_drop(SignalMessage::StreamStarted {
                room_id: room_id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Shared::start_health_ticker(shared, &room_id);

        info!(room_id = %room_id, broadcaster_id = %shared.broadcaster_id, "Broadcast live");
        Ok(room_id)
    }

    /// Tear the room down: every session, timer and subscription goes with it
    pub async fn stop_broadcast(&self, reason: Option<&str>) -> Result<()> {
        let state = self.shared.lifecycle.state();
        if !state.is_broadcasting() {
            return Err(Error::InvalidTransition {
                from: state,
                to: StreamState::Stopping,
            });
        }
        self.shared.lifecycle.transition(StreamState::Stopping)?;
        self.shared
            .teardown(reason.unwrap_or("broadcast ended by operator"))
            .await;
        Ok(())
    }

    pub fn start_screen_share(&self) -> Result<()> {
        self.shared.switch_mode(StreamState::ScreenSharing)
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.shared.leave_mode(StreamState::ScreenSharing)
    }

    pub fn start_recording(&self) -> Result<()> {
        self.shared.switch_mode(StreamState::Recording)
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.shared.leave_mode(StreamState::Recording)
    }

    pub async fn approve_mic(&self, viewer_id: &ViewerId) -> Result<MicRequest> {
        self.shared.answer_mic(viewer_id, true).await
    }

    pub async fn reject_mic(&self, viewer_id: &ViewerId) -> Result<MicRequest> {
        self.shared.answer_mic(viewer_id, false).await
    }

    /// Ask a viewer to disable its outbound audio
    pub async fn mute_user_mic(&self, viewer_id: &ViewerId) -> Result<()> {
        self.shared.room_id()?;
        self.shared.mic.mute(viewer_id);
        self.shared
            .signaling
            .send(SignalMessage::MuteUserMic {
                socket_id: viewer_id.clone(),
            })
            .await?;
        info!(viewer_id = %viewer_id, "Viewer mic muted");
        Ok(())
    }

    pub async fn send_admin_chat(&self, message: impl Into<String>) -> Result<()> {
        let room_id = self.shared.room_id()?;
        self.shared
            .signaling
            .send(SignalMessage::AdminChat {
                room_id,
                message: message.into(),
                user: UserInfo::named(self.shared.broadcaster_id.clone()),
            })
            .await
    }

    /// Snapshot left behind by an exhausted reconnection cycle
    pub async fn pending_recovery(&self) -> Result<Option<RecoverySnapshot>> {
        self.shared.snapshots.load().await
    }

    pub async fn clear_recovery(&self) -> Result<()> {
        self.shared.snapshots.clear().await
    }
}

impl Shared {
    fn spawn_pump(
        shared: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
        mut registry_signals: mpsc::UnboundedReceiver<RegistrySignal>,
    ) {
        let weak = Arc::downgrade(shared);
        let token = shared.pump.clone();
        let mut lifecycle = shared.lifecycle.subscribe();
        let mut viewer_count = shared.registry.subscribe_viewer_count();
        let mut recovery = shared.reconnect.subscribe();

        tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    () = token.cancelled() => break,
                    Some(event) = signals.recv() => PumpInput::Signal(event),
                    Some(signal) = registry_signals.recv() => PumpInput::Registry(signal),
                    Ok(change) = lifecycle.recv() => PumpInput::Lifecycle(change),
                    Ok(()) = viewer_count.changed() => {
                        PumpInput::ViewerCount(*viewer_count.borrow_and_update())
                    }
                    Ok(event) = recovery.recv() => PumpInput::Recovery(event),
                };
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.on_input(input);
            }
            debug!("Broadcast event pump stopped");
        });
    }

    fn on_input(self: &Arc<Self>, input: PumpInput) {
        match input {
            PumpInput::Signal(SignalEvent::Message(envelope)) => self.on_signal(envelope),
            PumpInput::Signal(SignalEvent::Connected) => {
                debug!("Signaling connected");
            }
            PumpInput::Signal(SignalEvent::Disconnected { reason }) => {
                if self.lifecycle.room().is_some() {
                    warn!(reason = %reason, "Signaling lost during broadcast");
                    self.report_failure(FailureScope::Signaling, &reason);
                }
            }
            PumpInput::Registry(RegistrySignal::SessionFailure { viewer_id, detail }) => {
                if self.lifecycle.accepts_viewers() {
                    self.report_failure(FailureScope::Session(viewer_id), &detail);
                }
            }
            PumpInput::Registry(RegistrySignal::SessionConnected { viewer_id }) => {
                self.reconnect.clear_session(&viewer_id);
            }
            PumpInput::Registry(RegistrySignal::ViewerDropped { viewer_id, reason }) => {
                self.reconnect.clear_session(&viewer_id);
                self.mic.forget(&viewer_id);
                self.emit(OperatorEvent::ViewerDropped { viewer_id, reason });
            }
            PumpInput::Lifecycle(change) => self.emit(OperatorEvent::Lifecycle(change)),
            PumpInput::ViewerCount(count) => self.emit(OperatorEvent::ViewerCount(count)),
            PumpInput::Recovery(event) => self.emit(OperatorEvent::Recovery(event)),
        }
    }

    fn on_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        let sender = envelope.sender_id;
        match envelope.message {
            SignalMessage::RoomCreated { room_id } => {
                self.room_created.send_replace(Some(room_id));
            }
            SignalMessage::ViewerJoined {
                socket_id,
                user_info,
                ..
            } => self.negotiate(socket_id, Negotiation::Join(user_info)),
            SignalMessage::ViewerLeft { socket_id, .. }
            | SignalMessage::DisconnectPeer { socket_id } => {
                self.negotiate(socket_id, Negotiation::Leave);
            }
            SignalMessage::Answer {
                answer, offer_id, ..
            } => {
                let Some(viewer_id) = sender else {
                    warn!("Answer without sender ignored");
                    return;
                };
                self.negotiate(viewer_id, Negotiation::Answer { answer, offer_id });
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                let Some(viewer_id) = sender else {
                    warn!("ICE candidate without sender ignored");
                    return;
                };
                self.negotiate(viewer_id, Negotiation::Candidate(candidate));
            }
            SignalMessage::MicRequest { user_info, .. } => {
                let Some(viewer_id) = sender else {
                    warn!("Mic request without sender ignored");
                    return;
                };
                let request = self.mic.record(viewer_id, user_info);
                self.emit(OperatorEvent::MicRequested(request));
            }
            SignalMessage::ChatMessage { message, user, .. } => {
                self.emit(OperatorEvent::Chat {
                    viewer_id: sender,
                    user,
                    message,
                });
            }
            SignalMessage::ServerError { message } => {
                warn!(message = %message, "Signaling server reported an error");
            }
            other => {
                debug!(event_type = other.event_type(), "Ignoring signal");
            }
        }
    }

    /// Queue `work` on the viewer's lane, opening the lane if needed
    fn negotiate(self: &Arc<Self>, viewer_id: ViewerId, work: Negotiation) {
        let Some(room_id) = self.lifecycle.room_id() else {
            debug!(viewer_id = %viewer_id, "Negotiation outside a room ignored");
            return;
        };

        let mut lanes = self.lanes.lock();
        let work = match lanes.get(&viewer_id) {
            Some(lane) => match lane.work.send(work) {
                Ok(()) => return,
                // The lane task is gone; open a fresh one.
                Err(mpsc::error::SendError(work)) => work,
            },
            None => work,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(work);
        lanes.insert(viewer_id.clone(), Lane { id, work: tx });
        drop(lanes);

        let span = logging::viewer_span(&room_id, &viewer_id);
        let token = self.supervisor.child_token();
        tokio::spawn(Self::run_lane(Arc::downgrade(self), viewer_id, id, rx, token).instrument(span));
    }

    async fn run_lane(
        weak: Weak<Self>,
        viewer_id: ViewerId,
        lane_id: u64,
        mut work: mpsc::UnboundedReceiver<Negotiation>,
        token: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                () = token.cancelled() => break,
                next = work.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let leaving = matches!(next, Negotiation::Leave);
            tokio::select! {
                () = token.cancelled() => break,
                () = shared.apply_negotiation(&viewer_id, next) => {}
            }
            if leaving && shared.retire_lane(&viewer_id, lane_id, &work) {
                break;
            }
        }
        debug!("Negotiation lane closed");
    }

    async fn apply_negotiation(&self, viewer_id: &ViewerId, work: Negotiation) {
        match work {
            Negotiation::Join(user_info) => {
                if let Err(e) = self.registry.viewer_joined(viewer_id, user_info).await {
                    warn!(error = %e, "Viewer join not accepted");
                }
            }
            Negotiation::Answer { answer, offer_id } => {
                if let Err(e) = self
                    .registry
                    .handle_answer(viewer_id, offer_id.as_ref(), answer)
                    .await
                {
                    warn!(error = %e, "Answer rejected");
                }
            }
            Negotiation::Candidate(candidate) => {
                if let Err(e) = self.registry.handle_ice_candidate(viewer_id, candidate).await {
                    debug!(error = %e, "Remote candidate dropped");
                }
            }
            Negotiation::Leave => {
                self.registry.viewer_left(viewer_id).await;
                self.mic.forget(viewer_id);
                self.reconnect.clear_session(viewer_id);
            }
        }
    }

    /// Close the lane if nothing was queued behind the leave
    ///
    /// Work is only ever queued under the lanes lock, so an empty lane that
    /// is removed here cannot receive anything else.
    fn retire_lane(&self, viewer_id: &ViewerId, lane_id: u64, work: &mpsc::UnboundedReceiver<Negotiation>) -> bool {
        let mut lanes = self.lanes.lock();
        if !work.is_empty() {
            return false;
        }
        if lanes.get(viewer_id).is_some_and(|lane| lane.id == lane_id) {
            lanes.remove(viewer_id);
        }
        true
    }

    async fn bootstrap_room(&self, room_id: &RoomId) -> Result<()> {
        self.room_created.send_replace(None);
        let mut created = self.room_created.subscribe();

        self.signaling.connect(room_id).await?;
        self.signaling
            .send(SignalMessage::CreateRoom {
                room_id: room_id.clone(),
            })
            .await?;

        let wait = created.wait_for(|created| created.as_ref() == Some(room_id));
        let result = match tokio::time::timeout(self.config.session.room_create_timeout(), wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::SignalingUnavailable(
                "room confirmation channel closed".to_string(),
            )),
            Err(_) => Err(Error::Timeout(format!("no roomCreated for {room_id}"))),
        };
        result
    }

    fn start_health_ticker(shared: &Arc<Self>, room_id: &RoomId) {
        let weak = Arc::downgrade(shared);
        let span = logging::room_span(room_id);
        shared.supervisor.spawn_ticker(
            TaskKey::HealthTicker,
            shared.config.health.sample_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.health_tick().await;
                    }
                }
                .instrument(span.clone())
            },
        );
    }

    async fn health_tick(self: &Arc<Self>) {
        let report = self.health.tick(&self.registry.sessions()).await;

        for sample in &report.samples {
            if let Some(tier) = sample.tier {
                self.emit(OperatorEvent::Quality {
                    viewer_id: sample.viewer_id.clone(),
                    tier,
                });
            }
        }

        let stats: Vec<_> = report.samples.iter().map(|sample| sample.stats).collect();
        if let Some(constraints) = self.quality.react(&stats).await {
            self.emit(OperatorEvent::ConstraintsAdjusted(constraints));
        }

        for viewer_id in report.silent {
            self.report_failure(
                FailureScope::Session(viewer_id),
                "no health sample within the silence timeout",
            );
        }
    }

    fn report_failure(self: &Arc<Self>, scope: FailureScope, detail: &str) {
        let target: Weak<dyn RecoveryTarget> = Arc::downgrade(self) as Weak<dyn RecoveryTarget>;
        self.reconnect.on_failure(target, scope, detail);
    }

    fn switch_mode(&self, mode: StreamState) -> Result<()> {
        let change = self.lifecycle.transition(mode)?;
        info!(old_state = %change.old, new_state = %change.new, "Broadcast mode changed");
        Ok(())
    }

    fn leave_mode(&self, mode: StreamState) -> Result<()> {
        let state = self.lifecycle.state();
        if state != mode {
            return Err(Error::InvalidTransition {
                from: state,
                to: StreamState::Live,
            });
        }
        self.switch_mode(StreamState::Live)
    }

    async fn answer_mic(&self, viewer_id: &ViewerId, approved: bool) -> Result<MicRequest> {
        self.room_id()?;
        let request = self
            .mic
            .resolve(viewer_id, approved)
            .ok_or_else(|| Error::SessionNotFound(viewer_id.clone()))?;
        self.signaling
            .send(SignalMessage::MicRequestResponse {
                socket_id: viewer_id.clone(),
                approved,
            })
            .await?;
        info!(viewer_id = %viewer_id, approved = approved, "Mic request answered");
        Ok(request)
    }

    fn room_id(&self) -> Result<RoomId> {
        self.lifecycle.room_id().ok_or(Error::RoomNotLive)
    }

    fn emit(&self, event: OperatorEvent) {
        let _ = self.operator.send(event);
    }

    /// Best-effort send; outbound messages are never queued
    async fn send_or_drop(&self, message: SignalMessage) {
        let event_type = message.event_type();
        if let Err(e) = self.signaling.send(message).await {
            warn!(event_type = event_type, error = %e, "Outbound signal dropped");
        }
    }

    async fn teardown(&self, reason: &str) {
        let _guard = self.teardown.lock().await;
        let Some(room_id) = self.lifecycle.room_id() else {
            return;
        };

        // Nothing scheduled may fire against the room while it closes.
        let cancelled = self.supervisor.cancel_all();
        self.lanes.lock().clear();

        self.send_or_drop(SignalMessage::StreamStopped {
            room_id: room_id.clone(),
            timestamp: Utc::now(),
            reason: Some(reason.to_string()),
        })
        .await;
        let closed = self.registry.close_all().await;
        self.lifecycle.force_idle(reason);
        self.health.clear();
        self.mic.clear();
        self.reconnect.reset();
        self.room_created.send_replace(None);
        self.signaling.disconnect().await;
        *self.last_stop_reason.lock() = Some(reason.to_string());

        let late = self.supervisor.cancel_all();
        self.lanes.lock().clear();
        info!(
            room_id = %room_id,
            reason = reason,
            closed_sessions = closed,
            cancelled_timers = cancelled + late,
            "Room torn down"
        );
    }
}

#[async_trait]
impl RecoveryTarget for Shared {
    async fn reestablish(&self) -> Result<RecreateReport> {
        let room_id = self.room_id()?;
        if !self.signaling.is_connected() {
            self.signaling.reconnect().await?;
            match self.lifecycle.room_id() {
                Some(current) if current == room_id => {}
                // A newer room owns the channel now
                Some(_) => return Err(Error::RoomNotLive),
                None => {
                    debug!(room_id = %room_id, "Room closed while signaling came back");
                    self.signaling.disconnect().await;
                    return Err(Error::RoomNotLive);
                }
            }
        }
        if !self.lifecycle.accepts_viewers() {
            return Ok(RecreateReport::default());
        }
        self.registry.recreate_sessions().await
    }

    async fn reopen_session(&self, viewer_id: &ViewerId) -> Result<bool> {
        if !self.lifecycle.accepts_viewers() {
            return Ok(false);
        }
        Ok(self.registry.reopen_session(viewer_id).await?.is_some())
    }

    async fn abandon_session(&self, viewer_id: &ViewerId, reason: &str) {
        self.registry.abandon_viewer(viewer_id, reason).await;
    }

    fn recovery_snapshot(&self, attempts: u32, reason: &str) -> Option<RecoverySnapshot> {
        let room = self.lifecycle.room()?;
        Some(RecoverySnapshot {
            room_id: room.room_id,
            broadcaster_id: room.broadcaster_id,
            viewers: self.registry.roster(),
            lifecycle_state: self.lifecycle.state(),
            reconnect_attempts: attempts,
            reason: reason.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn announce_recovery(&self, snapshot: &RecoverySnapshot) {
        self.send_or_drop(SignalMessage::RecoveryAttempt {
            room_id: snapshot.room_id.clone(),
            viewers: snapshot.viewers.clone(),
            timestamp: snapshot.created_at,
        })
        .await;
    }

    async fn force_stop(&self, reason: &str) {
        error!(reason = reason, "Recovery exhausted, force-stopping the room");
        self.teardown(reason).await;
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}
