//! Broadcaster-side session registry
//!
//! The registry is the only writer of the viewer → [`PeerSession`] map and of
//! the room roster. Map access never spans an await point, so one viewer's
//! outstanding negotiation never blocks another's.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::lifecycle::StreamLifecycle;
use crate::logging;
use crate::peer::{CandidateDisposition, OfferTimeout, PeerSession, SessionEvent, SessionState};
use crate::signaling::{SignalMessage, SignalingChannel};
use crate::supervisor::{ResourceSupervisor, TaskKey};
use crate::transport::{
    CaptureSource, IceCandidate, SessionDescription, TransportEvent, TransportFactory,
};
use crate::types::{OfferId, UserInfo, ViewerId};

const SESSION_EVENT_CAPACITY: usize = 256;

/// Something the registry could not resolve on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySignal {
    /// Transport of a live session went down
    SessionFailure { viewer_id: ViewerId, detail: String },
    /// A session reached `connected`
    SessionConnected { viewer_id: ViewerId },
    /// Viewer removed after exhausting offer or session retries
    ViewerDropped { viewer_id: ViewerId, reason: String },
}

/// Outcome of re-creating every roster session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecreateReport {
    pub recreated: usize,
    /// Viewers whose session could not be re-opened, with the reason
    pub failed: Vec<(ViewerId, String)>,
}

/// What an offer-ack expiry led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAckOutcome {
    Ignored,
    Retried { attempt: u32 },
    Dropped,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<ViewerId, Arc<PeerSession>>>,
    roster: Mutex<BTreeMap<ViewerId, Option<UserInfo>>>,
    lifecycle: Arc<StreamLifecycle>,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    capture: Arc<dyn CaptureSource>,
    supervisor: Arc<ResourceSupervisor>,
    config: SessionConfig,
    session_events: broadcast::Sender<SessionEvent>,
    viewer_count: watch::Sender<usize>,
    signals: mpsc::UnboundedSender<RegistrySignal>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        lifecycle: Arc<StreamLifecycle>,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        capture: Arc<dyn CaptureSource>,
        supervisor: Arc<ResourceSupervisor>,
        signals: mpsc::UnboundedSender<RegistrySignal>,
    ) -> Self {
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (viewer_count, _) = watch::channel(0);
        Self {
            sessions: Mutex::new(HashMap::new()),
            roster: Mutex::new(BTreeMap::new()),
            lifecycle,
            factory,
            signaling,
            capture,
            supervisor,
            config,
            session_events,
            viewer_count,
            signals,
        }
    }

    /// Open a session for `viewer_id` and dispatch its first offer
    ///
    /// Fails with `RoomNotLive` outside a broadcasting state and with
    /// `AlreadyExists` while the viewer's current session still has an offer
    /// younger than the duplicate window. Any other existing session is
    /// closed and replaced.
    pub async fn create_session(self: &Arc<Self>, viewer_id: &ViewerId) -> Result<Arc<PeerSession>> {
        if let Some(existing) = self.get(viewer_id) {
            if !existing.state().is_terminal()
                && existing
                    .offer_in_flight(self.config.duplicate_offer_window())
                    .await
            {
                return Err(Error::AlreadyExists(viewer_id.clone()));
            }
        }
        self.open_session(viewer_id).await
    }

    /// Close and remove a viewer's session and drop it from the roster
    pub async fn destroy_session(&self, viewer_id: &ViewerId) -> bool {
        let removed = self.remove_from_roster(viewer_id);
        let closed = self.close_session(viewer_id).await;
        removed || closed
    }

    #[must_use]
    pub fn get(&self, viewer_id: &ViewerId) -> Option<Arc<PeerSession>> {
        self.sessions.lock().get(viewer_id).cloned()
    }

    /// Every session currently in the map
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Viewers the room considers present, sorted
    #[must_use]
    pub fn roster(&self) -> Vec<ViewerId> {
        self.roster.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn user_info(&self, viewer_id: &ViewerId) -> Option<UserInfo> {
        self.roster.lock().get(viewer_id).cloned().flatten()
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.roster.lock().len()
    }

    #[must_use]
    pub fn subscribe_viewer_count(&self) -> watch::Receiver<usize> {
        self.viewer_count.subscribe()
    }

    #[must_use]
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    /// A viewer announced itself; it gets a session and, once the first
    /// offer is out, a roster entry
    pub async fn viewer_joined(
        self: &Arc<Self>,
        viewer_id: &ViewerId,
        user_info: Option<UserInfo>,
    ) -> Result<Arc<PeerSession>> {
        if !self.lifecycle.accepts_viewers() {
            return Err(Error::RoomNotLive);
        }
        let session = self.create_session(viewer_id).await?;
        {
            let mut roster = self.roster.lock();
            roster.insert(viewer_id.clone(), user_info);
            self.viewer_count.send_replace(roster.len());
        }
        info!(viewer_id = %viewer_id, viewer_count = self.viewer_count(), "Viewer joined");
        Ok(session)
    }

    pub async fn viewer_left(&self, viewer_id: &ViewerId) -> bool {
        let left = self.destroy_session(viewer_id).await;
        if left {
            info!(viewer_id = %viewer_id, viewer_count = self.viewer_count(), "Viewer left");
        }
        left
    }

    pub async fn handle_answer(
        &self,
        viewer_id: &ViewerId,
        offer_id: Option<&OfferId>,
        answer: SessionDescription,
    ) -> Result<()> {
        let session = self
            .get(viewer_id)
            .ok_or_else(|| Error::SessionNotFound(viewer_id.clone()))?;
        session.handle_answer(offer_id, answer).await?;
        self.supervisor.cancel(&TaskKey::OfferAck(viewer_id.clone()));
        Ok(())
    }

    pub async fn handle_ice_candidate(
        &self,
        viewer_id: &ViewerId,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition> {
        let session = self
            .get(viewer_id)
            .ok_or_else(|| Error::SessionNotFound(viewer_id.clone()))?;
        session.add_remote_candidate(candidate).await
    }

    /// Expiry of the ack timer for `offer_id`
    ///
    /// Expiries up to `max_offer_retries` re-offer on the same session with a
    /// new offer id; the next one closes the session and drops the viewer.
    pub async fn on_offer_timeout(
        self: &Arc<Self>,
        viewer_id: &ViewerId,
        offer_id: &OfferId,
    ) -> OfferAckOutcome {
        let Some(session) = self.get(viewer_id) else {
            return OfferAckOutcome::Ignored;
        };
        let failures = match session.expire_offer(offer_id).await {
            OfferTimeout::Stale => return OfferAckOutcome::Ignored,
            OfferTimeout::Expired { failures } => failures,
        };

        if failures > self.config.max_offer_retries {
            warn!(
                viewer_id = %viewer_id,
                failures = failures,
                "Offer never acknowledged, dropping viewer"
            );
            self.drop_viewer(viewer_id, format!("no answer after {failures} offers"))
                .await;
            return OfferAckOutcome::Dropped;
        }

        warn!(
            viewer_id = %viewer_id,
            offer_id = %offer_id,
            failures = failures,
            "Offer timed out, retrying"
        );
        match self.dispatch_offer(&session).await {
            Ok(_) => OfferAckOutcome::Retried {
                attempt: failures + 1,
            },
            Err(e) => {
                warn!(viewer_id = %viewer_id, error = %e, "Re-offer failed, dropping viewer");
                self.drop_viewer(viewer_id, e.to_string()).await;
                OfferAckOutcome::Dropped
            }
        }
    }

    /// Replace the session of every roster viewer
    ///
    /// A viewer whose session cannot be re-opened stays on the roster and is
    /// listed in the report for its own retry.
    pub async fn recreate_sessions(self: &Arc<Self>) -> Result<RecreateReport> {
        if !self.lifecycle.accepts_viewers() {
            return Err(Error::RoomNotLive);
        }
        let roster = self.roster();
        let results = join_all(roster.iter().map(|viewer_id| self.open_session(viewer_id))).await;

        let mut report = RecreateReport::default();
        for (viewer_id, result) in roster.into_iter().zip(results) {
            match result {
                Ok(_) => report.recreated += 1,
                Err(e) => {
                    warn!(viewer_id = %viewer_id, error = %e, "Failed to recreate session");
                    report.failed.push((viewer_id, e.to_string()));
                }
            }
        }
        info!(
            recreated = report.recreated,
            failed = report.failed.len(),
            "Sessions recreated for roster"
        );
        Ok(report)
    }

    /// Open a fresh session for a viewer still on the roster
    ///
    /// `Ok(None)` when the viewer has left in the meantime.
    pub async fn reopen_session(self: &Arc<Self>, viewer_id: &ViewerId) -> Result<Option<Arc<PeerSession>>> {
        if !self.roster.lock().contains_key(viewer_id) {
            return Ok(None);
        }
        let session = self.open_session(viewer_id).await?;
        debug!(viewer_id = %viewer_id, "Session re-opened");
        Ok(Some(session))
    }

    /// Remove a viewer the room gave up on and report it as dropped
    pub async fn abandon_viewer(&self, viewer_id: &ViewerId, reason: &str) {
        self.drop_viewer(viewer_id, reason.to_string()).await;
    }

    /// Close every session and empty the roster; returns how many sessions were closed
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        {
            let mut roster = self.roster.lock();
            roster.clear();
            self.viewer_count.send_replace(0);
        }

        let count = drained.len();
        for viewer_id in drained.iter().map(|(id, _)| id) {
            self.supervisor.cancel(&TaskKey::OfferAck(viewer_id.clone()));
        }
        join_all(drained.iter().map(|(_, session)| session.close())).await;

        if count > 0 {
            info!(closed = count, "All sessions closed");
        }
        count
    }

    async fn open_session(self: &Arc<Self>, viewer_id: &ViewerId) -> Result<Arc<PeerSession>> {
        let room_id = match self.lifecycle.room_id() {
            Some(room_id) if self.lifecycle.accepts_viewers() => room_id,
            _ => return Err(Error::RoomNotLive),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(viewer_id, events_tx).await?;
        let session = Arc::new(PeerSession::new(
            viewer_id.clone(),
            room_id,
            transport,
            self.session_events.clone(),
        ));

        let displaced = self
            .sessions
            .lock()
            .insert(viewer_id.clone(), Arc::clone(&session));
        if let Some(previous) = displaced {
            debug!(viewer_id = %viewer_id, "Replacing existing session");
            previous.close().await;
        }

        self.spawn_transport_pump(&session, events_rx);

        if let Err(e) = self.dispatch_offer(&session).await {
            warn!(viewer_id = %viewer_id, error = %e, "Initial offer failed");
            self.close_session_if_current(&session).await;
            return Err(e);
        }

        let mut roster = self.roster.lock();
        if !roster.contains_key(viewer_id) {
            roster.insert(viewer_id.clone(), None);
            self.viewer_count.send_replace(roster.len());
        }
        drop(roster);
        Ok(session)
    }

    async fn dispatch_offer(self: &Arc<Self>, session: &Arc<PeerSession>) -> Result<OfferId> {
        let offer_id = session
            .send_offer(
                self.signaling.as_ref(),
                self.config.duplicate_offer_window(),
                self.capture.is_available(),
            )
            .await?;

        let viewer_id = session.viewer_id().clone();
        self.supervisor.schedule(
            TaskKey::OfferAck(viewer_id.clone()),
            self.config.offer_ack_timeout(),
            Self::offer_ack_expired(Arc::downgrade(self), viewer_id, offer_id.clone()),
        );
        Ok(offer_id)
    }

    // Boxed: the expiry re-offers through `dispatch_offer`, which schedules the next expiry.
    fn offer_ack_expired(registry: Weak<Self>, viewer_id: ViewerId, offer_id: OfferId) -> BoxFuture<'static, ()> {
        async move {
            if let Some(registry) = registry.upgrade() {
                registry.on_offer_timeout(&viewer_id, &offer_id).await;
            }
        }
        .boxed()
    }

    /// Forward this session's transport events until the room is torn down
    fn spawn_transport_pump(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let span = logging::viewer_span(session.room_id(), session.viewer_id());
        let registry: Weak<Self> = Arc::downgrade(self);
        let session = Arc::downgrade(session);
        let token = self.supervisor.child_token();
        let pump = async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) else {
                    break;
                };
                registry.on_transport_event(&session, event).await;
            }
        };
        tokio::spawn(pump.instrument(span));
    }

    async fn on_transport_event(&self, session: &Arc<PeerSession>, event: TransportEvent) {
        if !self.is_current(session) {
            debug!(viewer_id = %session.viewer_id(), "Ignoring event from replaced transport");
            return;
        }
        let viewer_id = session.viewer_id().clone();

        match event {
            TransportEvent::LocalCandidate { candidate, .. } => {
                let message = SignalMessage::IceCandidate {
                    room_id: session.room_id().clone(),
                    candidate,
                    target_viewer_id: Some(viewer_id.clone()),
                };
                if let Err(e) = self.signaling.send(message).await {
                    debug!(viewer_id = %viewer_id, error = %e, "Local candidate dropped");
                }
            }
            TransportEvent::StateChanged { state, .. } => {
                let change = match session.on_transport_state(state) {
                    Ok(Some(change)) => change,
                    Ok(None) => return,
                    Err(e) => {
                        debug!(viewer_id = %viewer_id, error = %e, "Transport state ignored");
                        return;
                    }
                };
                match change.new {
                    SessionState::Connected => {
                        info!(viewer_id = %viewer_id, "Viewer connected");
                        let _ = self.signals.send(RegistrySignal::SessionConnected { viewer_id });
                    }
                    SessionState::Disconnected => {
                        let _ = self.signals.send(RegistrySignal::SessionFailure {
                            viewer_id,
                            detail: "transport disconnected".to_string(),
                        });
                    }
                    SessionState::Failed => {
                        warn!(viewer_id = %viewer_id, "Transport failed, closing session");
                        self.close_session_if_current(session).await;
                        let _ = self.signals.send(RegistrySignal::SessionFailure {
                            viewer_id,
                            detail: "transport failed".to_string(),
                        });
                    }
                    SessionState::Closed => {
                        self.close_session_if_current(session).await;
                    }
                    _ => {}
                }
            }
        }
    }

    fn is_current(&self, session: &Arc<PeerSession>) -> bool {
        self.sessions
            .lock()
            .get(session.viewer_id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    async fn drop_viewer(&self, viewer_id: &ViewerId, reason: String) {
        self.destroy_session(viewer_id).await;
        let _ = self.signals.send(RegistrySignal::ViewerDropped {
            viewer_id: viewer_id.clone(),
            reason,
        });
    }

    async fn close_session(&self, viewer_id: &ViewerId) -> bool {
        let removed = self.sessions.lock().remove(viewer_id);
        self.supervisor.cancel(&TaskKey::OfferAck(viewer_id.clone()));
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    async fn close_session_if_current(&self, session: &Arc<PeerSession>) {
        let viewer_id = session.viewer_id().clone();
        let removed = {
            let mut sessions = self.sessions.lock();
            let is_current = sessions
                .get(&viewer_id)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if is_current {
                sessions.remove(&viewer_id)
            } else {
                None
            }
        };
        if removed.is_some() {
            self.supervisor.cancel(&TaskKey::OfferAck(viewer_id));
        }
        session.close().await;
    }

    fn remove_from_roster(&self, viewer_id: &ViewerId) -> bool {
        let mut roster = self.roster.lock();
        let removed = roster.remove(viewer_id).is_some();
        if removed {
            self.viewer_count.send_replace(roster.len());
        }
        removed
    }
}
