use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{SignalEnvelope, SignalMessage};
use crate::error::{Error, Result};
use crate::types::{RoomId, UserInfo, ViewerId};

/// Message sender for one connection
pub type EnvelopeSender = mpsc::UnboundedSender<SignalEnvelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcaster => f.write_str("broadcaster"),
            Self::Viewer => f.write_str("viewer"),
        }
    }
}

#[derive(Debug, Clone)]
struct Participant {
    connection_id: ViewerId,
    role: Role,
    user_info: Option<UserInfo>,
    sender: EnvelopeSender,
}

/// In-memory, room-scoped signaling router (single node)
///
/// Every relayed frame is stamped with the sender's connection id, so clients
/// cannot impersonate each other.
#[derive(Clone)]
pub struct SignalingHub {
    /// room_id -> participants
    rooms: Arc<DashMap<RoomId, Vec<Participant>>>,

    /// connection_id -> (room_id, role) for routing and cleanup
    connections: Arc<DashMap<ViewerId, (RoomId, Role)>>,

    online: Arc<AtomicBool>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Subscribe a connection to a room; an existing subscription of the same
    /// connection is replaced
    pub fn subscribe(
        &self,
        room_id: RoomId,
        role: Role,
        connection_id: ViewerId,
    ) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>> {
        if !self.is_online() {
            return Err(Error::SignalingUnavailable(
                "signaling server unreachable".to_string(),
            ));
        }

        self.detach(&connection_id);

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut participants = self.rooms.entry(room_id.clone()).or_default();
            if role == Role::Broadcaster
                && participants.iter().any(|p| p.role == Role::Broadcaster)
            {
                return Err(Error::SignalingUnavailable(format!(
                    "room {room_id} already has a broadcaster"
                )));
            }
            participants.push(Participant {
                connection_id: connection_id.clone(),
                role,
                user_info: None,
                sender: tx,
            });
        }
        self.connections
            .insert(connection_id.clone(), (room_id.clone(), role));

        info!(
            room_id = %room_id,
            connection_id = %connection_id,
            role = %role,
            "Connection subscribed to room"
        );
        Ok(rx)
    }

    /// Remove a connection and tell the room it left
    ///
    /// A viewer leaving produces `viewerLeft` for the broadcaster; the
    /// broadcaster leaving produces `stream-stopped` for every viewer.
    pub fn unsubscribe(&self, connection_id: &ViewerId) -> bool {
        let Some((room_id, role)) = self.detach(connection_id) else {
            warn!(connection_id = %connection_id, "Attempted to unsubscribe unknown connection");
            return false;
        };

        match role {
            Role::Viewer => {
                let message = SignalMessage::ViewerLeft {
                    socket_id: connection_id.clone(),
                    viewer_count: self.viewer_count(&room_id),
                };
                self.send_to_role(&room_id, Role::Broadcaster, None, &SignalEnvelope::new(message));
            }
            Role::Broadcaster => {
                let message = SignalMessage::StreamStopped {
                    room_id: room_id.clone(),
                    timestamp: Utc::now(),
                    reason: Some("broadcaster disconnected".to_string()),
                };
                self.send_to_role(&room_id, Role::Viewer, None, &SignalEnvelope::new(message));
            }
        }

        info!(
            room_id = %room_id,
            connection_id = %connection_id,
            role = %role,
            "Connection unsubscribed from room"
        );
        true
    }

    /// Route a message from `from` inside its room; returns the number of deliveries
    pub fn relay(&self, from: &ViewerId, message: SignalMessage) -> Result<usize> {
        if !self.is_online() {
            return Err(Error::SignalingUnavailable(
                "signaling server unreachable".to_string(),
            ));
        }
        let (room_id, role) = self
            .connections
            .get(from)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SignalingUnavailable(format!("{from} is not connected")))?;

        let event_type = message.event_type();
        let sent = match (role, message) {
            (Role::Broadcaster, SignalMessage::CreateRoom { .. }) => {
                let reply = SignalMessage::RoomCreated {
                    room_id: room_id.clone(),
                };
                self.send_to(&room_id, from, &SignalEnvelope::new(reply))
            }
            (Role::Viewer, SignalMessage::ViewerJoin { user_info, .. }) => {
                if let Some(mut participants) = self.rooms.get_mut(&room_id) {
                    if let Some(p) = participants.iter_mut().find(|p| p.connection_id == *from) {
                        p.user_info.clone_from(&user_info);
                    }
                }
                let joined = SignalMessage::ViewerJoined {
                    socket_id: from.clone(),
                    user_info,
                    viewer_count: self.viewer_count(&room_id),
                };
                self.send_to_role(&room_id, Role::Broadcaster, None, &SignalEnvelope::new(joined))
            }
            (Role::Viewer, message @ SignalMessage::ChatMessage { .. }) => {
                let envelope = SignalEnvelope::from_sender(from.clone(), message);
                self.send_to_role(&room_id, Role::Broadcaster, None, &envelope)
                    + self.send_to_role(&room_id, Role::Viewer, Some(from), &envelope)
            }
            (Role::Viewer, message) => {
                let envelope = SignalEnvelope::from_sender(from.clone(), message);
                self.send_to_role(&room_id, Role::Broadcaster, None, &envelope)
            }
            (Role::Broadcaster, message) => {
                let target = message.target_viewer().cloned();
                let envelope = SignalEnvelope::from_sender(from.clone(), message);
                match target {
                    Some(target) => self.send_to(&room_id, &target, &envelope),
                    None => self.send_to_role(&room_id, Role::Viewer, None, &envelope),
                }
            }
        };

        debug!(
            room_id = %room_id,
            sender = %from,
            event_type = event_type,
            sent_count = sent,
            "Signal relayed"
        );
        Ok(sent)
    }

    /// Take the server up or down; going down drops every connection at once
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online && !online {
            let dropped = self.connections.len();
            self.rooms.clear();
            self.connections.clear();
            warn!(dropped_connections = dropped, "Signaling hub went offline");
        } else if !was_online && online {
            info!("Signaling hub back online");
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn viewer_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |participants| {
            participants.iter().filter(|p| p.role == Role::Viewer).count()
        })
    }

    #[must_use]
    pub fn has_broadcaster(&self, room_id: &RoomId) -> bool {
        self.rooms.get(room_id).is_some_and(|participants| {
            participants.iter().any(|p| p.role == Role::Broadcaster)
        })
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn detach(&self, connection_id: &ViewerId) -> Option<(RoomId, Role)> {
        let (_, (room_id, role)) = self.connections.remove(connection_id)?;
        if let Some(mut participants) = self.rooms.get_mut(&room_id) {
            participants.retain(|p| p.connection_id != *connection_id);
            if participants.is_empty() {
                drop(participants);
                self.rooms.remove(&room_id);
                debug!(room_id = %room_id, "Room has no more participants, removed");
            }
        }
        Some((room_id, role))
    }

    fn send_to(&self, room_id: &RoomId, target: &ViewerId, envelope: &SignalEnvelope) -> usize {
        self.deliver(room_id, envelope, |p| p.connection_id == *target)
    }

    fn send_to_role(
        &self,
        room_id: &RoomId,
        role: Role,
        except: Option<&ViewerId>,
        envelope: &SignalEnvelope,
    ) -> usize {
        self.deliver(room_id, envelope, |p| {
            p.role == role && except.is_none_or(|id| p.connection_id != *id)
        })
    }

    fn deliver(
        &self,
        room_id: &RoomId,
        envelope: &SignalEnvelope,
        filter: impl Fn(&Participant) -> bool,
    ) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(participants) = self.rooms.get(room_id) {
            for participant in participants.iter().filter(|p| filter(p)) {
                match participant.sender.send(envelope.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(err) => {
                        warn!(
                            room_id = %room_id,
                            connection_id = %participant.connection_id,
                            error = %err,
                            "Failed to deliver signal, marking for cleanup"
                        );
                        failed_connections.push(participant.connection_id.clone());
                    }
                }
            }
        }

        for connection_id in failed_connections {
            self.unsubscribe(&connection_id);
        }
        sent_count
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{IceCandidate, SdpType, SessionDescription};
    use crate::types::OfferId;

    fn room() -> RoomId {
        RoomId::from("room1")
    }

    #[test]
    fn test_create_room_and_join() {
        let hub = SignalingHub::new();
        let mut host = hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("host"))
            .unwrap();
        let _viewer = hub
            .subscribe(room(), Role::Viewer, ViewerId::from("v1"))
            .unwrap();

        hub.relay(&ViewerId::from("host"), SignalMessage::CreateRoom { room_id: room() })
            .unwrap();
        assert_eq!(
            host.try_recv().unwrap().message,
            SignalMessage::RoomCreated { room_id: room() }
        );

        hub.relay(
            &ViewerId::from("v1"),
            SignalMessage::ViewerJoin {
                room_id: room(),
                user_info: Some(UserInfo::named("alice")),
            },
        )
        .unwrap();
        match host.try_recv().unwrap().message {
            SignalMessage::ViewerJoined {
                socket_id,
                viewer_count,
                user_info,
            } => {
                assert_eq!(socket_id, ViewerId::from("v1"));
                assert_eq!(viewer_count, 1);
                assert_eq!(user_info, Some(UserInfo::named("alice")));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_targeted_routing_and_sender_stamp() {
        let hub = SignalingHub::new();
        let mut host = hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("host"))
            .unwrap();
        let mut v1 = hub.subscribe(room(), Role::Viewer, ViewerId::from("v1")).unwrap();
        let mut v2 = hub.subscribe(room(), Role::Viewer, ViewerId::from("v2")).unwrap();

        let offer = SignalMessage::Offer {
            room_id: room(),
            offer: SessionDescription::new(SdpType::Offer, "v=0"),
            target_viewer_id: ViewerId::from("v2"),
            offer_id: OfferId::from("o1"),
            timestamp: Utc::now(),
        };
        assert_eq!(hub.relay(&ViewerId::from("host"), offer).unwrap(), 1);
        assert!(v1.try_recv().is_err());
        let received = v2.try_recv().unwrap();
        assert_eq!(received.sender_id, Some(ViewerId::from("host")));

        let candidate = SignalMessage::IceCandidate {
            room_id: room(),
            candidate: IceCandidate::new("candidate:1"),
            target_viewer_id: None,
        };
        hub.relay(&ViewerId::from("v1"), candidate).unwrap();
        assert_eq!(host.try_recv().unwrap().sender_id, Some(ViewerId::from("v1")));
    }

    #[test]
    fn test_disconnect_notifications() {
        let hub = SignalingHub::new();
        let mut host = hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("host"))
            .unwrap();
        let mut v1 = hub.subscribe(room(), Role::Viewer, ViewerId::from("v1")).unwrap();
        let _v2 = hub.subscribe(room(), Role::Viewer, ViewerId::from("v2")).unwrap();

        assert!(hub.unsubscribe(&ViewerId::from("v2")));
        assert_eq!(
            host.try_recv().unwrap().message,
            SignalMessage::ViewerLeft {
                socket_id: ViewerId::from("v2"),
                viewer_count: 1,
            }
        );

        hub.unsubscribe(&ViewerId::from("host"));
        assert!(matches!(
            v1.try_recv().unwrap().message,
            SignalMessage::StreamStopped { .. }
        ));
        assert!(!hub.unsubscribe(&ViewerId::from("host")));
    }

    #[test]
    fn test_second_broadcaster_rejected() {
        let hub = SignalingHub::new();
        let _host = hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("host"))
            .unwrap();
        assert!(hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("intruder"))
            .is_err());
        assert!(hub.has_broadcaster(&room()));
    }

    #[test]
    fn test_offline_hub_rejects_everything() {
        let hub = SignalingHub::new();
        let _host = hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("host"))
            .unwrap();

        hub.set_online(false);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub
            .subscribe(room(), Role::Viewer, ViewerId::from("v1"))
            .is_err());
        assert!(hub
            .relay(&ViewerId::from("host"), SignalMessage::CreateRoom { room_id: room() })
            .is_err());
    }

    #[test]
    fn test_dead_connection_cleaned_up() {
        let hub = SignalingHub::new();
        let _host = hub
            .subscribe(room(), Role::Broadcaster, ViewerId::from("host"))
            .unwrap();
        drop(hub.subscribe(room(), Role::Viewer, ViewerId::from("v1")).unwrap());

        let started = SignalMessage::StreamStarted {
            room_id: room(),
            timestamp: Utc::now(),
        };
        assert_eq!(hub.relay(&ViewerId::from("host"), started).unwrap(), 0);
        assert_eq!(hub.viewer_count(&room()), 0);
    }
}
