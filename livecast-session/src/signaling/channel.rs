use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::hub::{Role, SignalingHub};
use super::messages::{SignalEnvelope, SignalMessage};
use crate::error::{Error, Result};
use crate::types::{RoomId, ViewerId};

/// What a signaling connection reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Message(SignalEnvelope),
    Connected,
    Disconnected { reason: String },
}

/// Room-scoped, bidirectional signaling transport
///
/// Delivery is best-effort: while disconnected `send` fails with
/// [`Error::SignalingUnavailable`] and the message is dropped, never queued.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Join the signaling scope of `room_id`
    async fn connect(&self, room_id: &RoomId) -> Result<()>;

    /// Re-join the room of the last `connect`
    async fn reconnect(&self) -> Result<()>;

    async fn disconnect(&self);

    async fn send(&self, message: SignalMessage) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Id the server knows this connection by
    fn connection_id(&self) -> ViewerId;

    /// Inbound event stream; only the first caller receives it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>>;
}

/// In-process connection to a [`SignalingHub`]
pub struct LocalSignalingChannel {
    hub: SignalingHub,
    role: Role,
    connection_id: ViewerId,
    room_id: Mutex<Option<RoomId>>,
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<SignalEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalEvent>>>,
}

impl LocalSignalingChannel {
    pub fn new(hub: SignalingHub, role: Role, connection_id: impl Into<ViewerId>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            hub,
            role,
            connection_id: connection_id.into(),
            room_id: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn broadcaster(hub: SignalingHub, connection_id: impl Into<ViewerId>) -> Self {
        Self::new(hub, Role::Broadcaster, connection_id)
    }

    pub fn viewer(hub: SignalingHub, connection_id: impl Into<ViewerId>) -> Self {
        Self::new(hub, Role::Viewer, connection_id)
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    fn subscribe(&self, room_id: &RoomId) -> Result<()> {
        let mut inbound = self
            .hub
            .subscribe(room_id.clone(), self.role, self.connection_id.clone())?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        *self.room_id.lock() = Some(room_id.clone());

        let events = self.events_tx.clone();
        let connected = Arc::clone(&self.connected);
        let current = Arc::clone(&self.generation);
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                if events.send(SignalEvent::Message(envelope)).is_err() {
                    return;
                }
            }
            // Superseded subscriptions end silently.
            if current.load(Ordering::SeqCst) == generation
                && connected.swap(false, Ordering::SeqCst)
            {
                warn!(connection_id = %connection_id, "Signaling connection lost");
                let _ = events.send(SignalEvent::Disconnected {
                    reason: "signaling server closed the connection".to_string(),
                });
            }
        });

        let _ = self.events_tx.send(SignalEvent::Connected);
        info!(
            connection_id = %self.connection_id,
            room_id = %room_id,
            role = %self.role,
            "Signaling connected"
        );
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for LocalSignalingChannel {
    async fn connect(&self, room_id: &RoomId) -> Result<()> {
        self.subscribe(room_id)
    }

    async fn reconnect(&self) -> Result<()> {
        let room_id = self
            .room_id
            .lock()
            .clone()
            .ok_or_else(|| Error::SignalingUnavailable("never connected".to_string()))?;
        self.subscribe(&room_id)
    }

    async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.hub.unsubscribe(&self.connection_id);
            debug!(connection_id = %self.connection_id, "Signaling disconnected");
        }
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalingUnavailable(format!(
                "{} dropped while disconnected",
                message.event_type()
            )));
        }
        self.hub.relay(&self.connection_id, message).map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> ViewerId {
        self.connection_id.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let channel = LocalSignalingChannel::broadcaster(SignalingHub::new(), "host");
        let err = channel
            .send(SignalMessage::ServerError {
                message: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_hub_outage_reports_disconnect_and_reconnect_recovers() {
        let hub = SignalingHub::new();
        let channel = LocalSignalingChannel::broadcaster(hub.clone(), "host");
        let mut events = channel.take_events().unwrap();
        assert!(channel.take_events().is_none());

        channel.connect(&RoomId::from("room1")).await.unwrap();
        assert_eq!(events.recv().await, Some(SignalEvent::Connected));

        hub.set_online(false);
        assert!(matches!(
            events.recv().await,
            Some(SignalEvent::Disconnected { .. })
        ));
        assert!(!channel.is_connected());
        assert!(channel.reconnect().await.is_err());

        hub.set_online(true);
        channel.reconnect().await.unwrap();
        assert_eq!(events.recv().await, Some(SignalEvent::Connected));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_subscription_silently() {
        let hub = SignalingHub::new();
        let channel = LocalSignalingChannel::broadcaster(hub.clone(), "host");
        let mut events = channel.take_events().unwrap();

        channel.connect(&RoomId::from("room1")).await.unwrap();
        channel.reconnect().await.unwrap();
        assert_eq!(events.recv().await, Some(SignalEvent::Connected));
        assert_eq!(events.recv().await, Some(SignalEvent::Connected));

        tokio::task::yield_now().await;
        assert!(channel.is_connected());
        assert!(events.try_recv().is_err());
    }
}
