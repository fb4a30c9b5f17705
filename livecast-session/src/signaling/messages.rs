use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::{IceCandidate, SessionDescription};
use crate::types::{OfferId, RoomId, UserInfo, ViewerId};

/// Room-scoped signaling messages exchanged between broadcaster, server and viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Broadcaster asks the server to open a room
    #[serde(rename = "createRoom", rename_all = "camelCase")]
    CreateRoom { room_id: RoomId },

    /// Server confirms the room
    #[serde(rename = "roomCreated", rename_all = "camelCase")]
    RoomCreated { room_id: RoomId },

    #[serde(rename = "stream-started", rename_all = "camelCase")]
    StreamStarted {
        room_id: RoomId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "stream-stopped", rename_all = "camelCase")]
    StreamStopped {
        room_id: RoomId,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Viewer asks to join a room
    #[serde(rename = "viewer-join", rename_all = "camelCase")]
    ViewerJoin {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_info: Option<UserInfo>,
    },

    /// Server tells the broadcaster a viewer arrived
    #[serde(rename = "viewerJoined", rename_all = "camelCase")]
    ViewerJoined {
        socket_id: ViewerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_info: Option<UserInfo>,
        viewer_count: usize,
    },

    /// Server tells the broadcaster a viewer went away
    #[serde(rename = "viewerLeft", rename_all = "camelCase")]
    ViewerLeft {
        socket_id: ViewerId,
        viewer_count: usize,
    },

    /// Broadcaster drops a viewer's peer leg
    #[serde(rename = "disconnectPeer", rename_all = "camelCase")]
    DisconnectPeer { socket_id: ViewerId },

    #[serde(rename = "webrtc-offer", rename_all = "camelCase")]
    Offer {
        room_id: RoomId,
        offer: SessionDescription,
        target_viewer_id: ViewerId,
        offer_id: OfferId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "webrtc-answer", rename_all = "camelCase")]
    Answer {
        room_id: RoomId,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_viewer_id: Option<ViewerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer_id: Option<OfferId>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_viewer_id: Option<ViewerId>,
    },

    #[serde(rename = "chat-message", rename_all = "camelCase")]
    ChatMessage {
        room_id: RoomId,
        message: String,
        user: UserInfo,
    },

    #[serde(rename = "admin-chat", rename_all = "camelCase")]
    AdminChat {
        room_id: RoomId,
        message: String,
        user: UserInfo,
    },

    #[serde(rename = "mic-request", rename_all = "camelCase")]
    MicRequest {
        room_id: RoomId,
        user_info: UserInfo,
    },

    #[serde(rename = "mic-request-response", rename_all = "camelCase")]
    MicRequestResponse { socket_id: ViewerId, approved: bool },

    #[serde(rename = "mute-user-mic", rename_all = "camelCase")]
    MuteUserMic { socket_id: ViewerId },

    /// Broadcaster exhausted its reconnection budget and is about to stop
    #[serde(rename = "recovery-attempt", rename_all = "camelCase")]
    RecoveryAttempt {
        room_id: RoomId,
        viewers: Vec<ViewerId>,
        timestamp: DateTime<Utc>,
    },

    /// Server-side rejection (unknown room, duplicate broadcaster, ...)
    #[serde(rename = "error", rename_all = "camelCase")]
    ServerError { message: String },
}

impl SignalMessage {
    /// Wire name of the message
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "createRoom",
            Self::RoomCreated { .. } => "roomCreated",
            Self::StreamStarted { .. } => "stream-started",
            Self::StreamStopped { .. } => "stream-stopped",
            Self::ViewerJoin { .. } => "viewer-join",
            Self::ViewerJoined { .. } => "viewerJoined",
            Self::ViewerLeft { .. } => "viewerLeft",
            Self::DisconnectPeer { .. } => "disconnectPeer",
            Self::Offer { .. } => "webrtc-offer",
            Self::Answer { .. } => "webrtc-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ChatMessage { .. } => "chat-message",
            Self::AdminChat { .. } => "admin-chat",
            Self::MicRequest { .. } => "mic-request",
            Self::MicRequestResponse { .. } => "mic-request-response",
            Self::MuteUserMic { .. } => "mute-user-mic",
            Self::RecoveryAttempt { .. } => "recovery-attempt",
            Self::ServerError { .. } => "error",
        }
    }

    /// Room the message belongs to, when it carries one
    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::CreateRoom { room_id }
            | Self::RoomCreated { room_id }
            | Self::StreamStarted { room_id, .. }
            | Self::StreamStopped { room_id, .. }
            | Self::ViewerJoin { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::ChatMessage { room_id, .. }
            | Self::AdminChat { room_id, .. }
            | Self::MicRequest { room_id, .. }
            | Self::RecoveryAttempt { room_id, .. } => Some(room_id),
            Self::ViewerJoined { .. }
            | Self::ViewerLeft { .. }
            | Self::DisconnectPeer { .. }
            | Self::MicRequestResponse { .. }
            | Self::MuteUserMic { .. }
            | Self::ServerError { .. } => None,
        }
    }

    /// Single viewer a broadcaster-originated message is addressed to
    #[must_use]
    pub const fn target_viewer(&self) -> Option<&ViewerId> {
        match self {
            Self::Offer {
                target_viewer_id, ..
            } => Some(target_viewer_id),
            Self::IceCandidate {
                target_viewer_id, ..
            }
            | Self::Answer {
                target_viewer_id, ..
            } => target_viewer_id.as_ref(),
            Self::DisconnectPeer { socket_id }
            | Self::MicRequestResponse { socket_id, .. }
            | Self::MuteUserMic { socket_id } => Some(socket_id),
            _ => None,
        }
    }
}

/// Wire frame: a message plus the sender id stamped by the server
///
/// Clients never set `senderId`; the relay overwrites it with the id of the
/// connection the frame arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ViewerId>,
    #[serde(flatten)]
    pub message: SignalMessage,
}

impl SignalEnvelope {
    #[must_use]
    pub const fn new(message: SignalMessage) -> Self {
        Self {
            sender_id: None,
            message,
        }
    }

    #[must_use]
    pub const fn from_sender(sender_id: ViewerId, message: SignalMessage) -> Self {
        Self {
            sender_id: Some(sender_id),
            message,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
