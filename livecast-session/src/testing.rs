//! In-memory test doubles for the transport, capture, audio, signaling and
//! snapshot boundaries

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::signaling::{SignalEvent, SignalMessage, SignalingChannel};
use crate::snapshot::{RecoverySnapshot, SnapshotStore};
use crate::transport::{
    CaptureConstraints, CaptureSource, IceCandidate, LocalAudio, MediaTrackInfo, PeerTransport,
    SdpType, SessionDescription, TrackKind, TransportEvent, TransportEventSender, TransportFactory,
    TransportState, TransportStats,
};
use crate::types::{RoomId, ViewerId};

/// One call observed by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Stats,
    Close,
}

pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    stats: Mutex<Option<TransportStats>>,
    fail_negotiation: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(Some(TransportStats::default())),
            fail_negotiation: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Candidates in the order they were applied
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::AddCandidate(c) => Some(c.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// `None` makes every stats read fail
    pub fn set_stats(&self, stats: Option<TransportStats>) {
        *self.stats.lock() = stats;
    }

    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: TransportCall) -> Result<()> {
        self.calls.lock().push(call);
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(Error::Transport("negotiation failure injected".to_string()));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(TransportCall::CreateOffer)?;
        Ok(SessionDescription::new(SdpType::Offer, "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(TransportCall::CreateAnswer)?;
        Ok(SessionDescription::new(SdpType::Answer, "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(TransportCall::SetLocal(description))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(TransportCall::SetRemote(description))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(TransportCall::AddCandidate(candidate))
    }

    async fn stats(&self) -> Result<TransportStats> {
        self.calls.lock().push(TransportCall::Stats);
        (*self.stats.lock()).ok_or_else(|| Error::Transport("stats unavailable".to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().push(TransportCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and lets tests push transport events
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<Vec<(ViewerId, Arc<MockTransport>)>>,
    senders: Mutex<HashMap<ViewerId, TransportEventSender>>,
    default_stats: Mutex<Option<TransportStats>>,
    failing: AtomicBool,
    failing_viewers: Mutex<HashSet<ViewerId>>,
    create_delays: Mutex<HashMap<ViewerId, Duration>>,
}

impl MockTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail transport creation for one viewer only
    pub fn set_failing_for(&self, viewer_id: &ViewerId, failing: bool) {
        let mut viewers = self.failing_viewers.lock();
        if failing {
            viewers.insert(viewer_id.clone());
        } else {
            viewers.remove(viewer_id);
        }
    }

    /// Make transport creation for `viewer_id` take `delay`
    pub fn set_create_delay(&self, viewer_id: &ViewerId, delay: Duration) {
        self.create_delays.lock().insert(viewer_id.clone(), delay);
    }

    /// Stats every transport created from now on starts with
    pub fn set_default_stats(&self, stats: TransportStats) {
        *self.default_stats.lock() = Some(stats);
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.transports.lock().len()
    }

    /// Most recent transport created for `viewer_id`
    #[must_use]
    pub fn transport(&self, viewer_id: &ViewerId) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == viewer_id)
            .map(|(_, t)| Arc::clone(t))
    }

    #[must_use]
    pub fn transports_for(&self, viewer_id: &ViewerId) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .filter(|(id, _)| id == viewer_id)
            .map(|(_, t)| Arc::clone(t))
            .collect()
    }

    /// Report a connection-state change as the latest transport of `viewer_id`
    pub fn emit_state(&self, viewer_id: &ViewerId, state: TransportState) -> bool {
        self.emit(TransportEvent::StateChanged {
            viewer_id: viewer_id.clone(),
            state,
        })
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        let viewer_id = match &event {
            TransportEvent::StateChanged { viewer_id, .. }
            | TransportEvent::LocalCandidate { viewer_id, .. } => viewer_id.clone(),
        };
        self.senders
            .lock()
            .get(&viewer_id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        viewer_id: &ViewerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let delay = self.create_delays.lock().get(viewer_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) || self.failing_viewers.lock().contains(viewer_id) {
            return Err(Error::Transport("transport creation failure injected".to_string()));
        }
        let transport = Arc::new(MockTransport::new());
        if let Some(stats) = *self.default_stats.lock() {
            transport.set_stats(Some(stats));
        }
        self.transports
            .lock()
            .push((viewer_id.clone(), Arc::clone(&transport)));
        self.senders.lock().insert(viewer_id.clone(), events);
        Ok(transport)
    }
}

pub struct MockCapture {
    available: AtomicBool,
    failing: AtomicBool,
    constraints: Mutex<CaptureConstraints>,
    applied: Mutex<Vec<CaptureConstraints>>,
}

impl MockCapture {
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            constraints: Mutex::new(CaptureConstraints::default()),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every constraint request fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_constraints(&self, constraints: CaptureConstraints) {
        *self.constraints.lock() = constraints;
    }

    /// Every constraint request received, including refused ones
    #[must_use]
    pub fn requests(&self) -> Vec<CaptureConstraints> {
        self.applied.lock().clone()
    }
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for MockCapture {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn tracks(&self) -> Vec<MediaTrackInfo> {
        if !self.is_available() {
            return Vec::new();
        }
        vec![
            MediaTrackInfo {
                id: "camera".to_string(),
                kind: TrackKind::Video,
                enabled: true,
            },
            MediaTrackInfo {
                id: "microphone".to_string(),
                kind: TrackKind::Audio,
                enabled: true,
            },
        ]
    }

    fn constraints(&self) -> CaptureConstraints {
        *self.constraints.lock()
    }

    async fn apply_constraints(&self, constraints: CaptureConstraints) -> Result<()> {
        self.applied.lock().push(constraints);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::CaptureUnavailable("constraint refused".to_string()));
        }
        *self.constraints.lock() = constraints;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLocalAudio {
    attached: AtomicBool,
    enabled: AtomicBool,
}

impl MockLocalAudio {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalAudio for MockLocalAudio {
    async fn attach(&self) -> Result<()> {
        self.attached.store(true, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Signaling channel that records outbound messages instead of routing them
pub struct RecordingChannel {
    connected: AtomicBool,
    reconnect_fails: AtomicBool,
    reconnect_delay: Mutex<Duration>,
    reconnects: AtomicUsize,
    sent: Mutex<Vec<SignalMessage>>,
    events_tx: mpsc::UnboundedSender<SignalEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalEvent>>>,
}

impl RecordingChannel {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(true),
            reconnect_fails: AtomicBool::new(false),
            reconnect_delay: Mutex::new(Duration::ZERO),
            reconnects: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn sent_of_type(&self, event_type: &str) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Drop the connection and report it to the owner
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(SignalEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn set_reconnect_fails(&self, fails: bool) {
        self.reconnect_fails.store(fails, Ordering::SeqCst);
    }

    /// Each reconnect takes `delay` before it resolves
    pub fn set_reconnect_delay(&self, delay: Duration) {
        *self.reconnect_delay.lock() = delay;
    }

    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn inject(&self, event: SignalEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn connect(&self, _room_id: &RoomId) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.reconnect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.reconnect_fails.load(Ordering::SeqCst) {
            return Err(Error::SignalingUnavailable("reconnect refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalingUnavailable(format!(
                "{} dropped while disconnected",
                message.event_type()
            )));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> ViewerId {
        ViewerId::from("recording")
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.events_rx.lock().take()
    }
}

/// Snapshot store whose writes always fail
#[derive(Default)]
pub struct FailingSnapshotStore {
    attempts: AtomicUsize,
}

impl FailingSnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for FailingSnapshotStore {
    async fn persist(&self, _snapshot: &RecoverySnapshot) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Snapshot("disk full".to_string()))
    }

    async fn load(&self) -> Result<Option<RecoverySnapshot>> {
        Ok(None)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}
