//! Boundary to the peer transport and the local capture device
//!
//! Both are opaque capabilities: the session core only negotiates through
//! [`PeerTransport`] and only asks [`CaptureSource`] for constraint changes.
//! The WebRTC-backed implementation lives in [`crate::rtc`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::ViewerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP blob in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Asynchronous notifications a transport pushes back to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        viewer_id: ViewerId,
        state: TransportState,
    },
    /// A locally gathered candidate that must be relayed to the remote side
    LocalCandidate {
        viewer_id: ViewerId,
        candidate: IceCandidate,
    },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Raw statistics as exposed by the transport; fields it cannot measure stay `None`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub rtt_ms: Option<f64>,
    pub bitrate_bps: Option<u64>,
    pub jitter_ms: Option<f64>,
    pub frame_rate: Option<f64>,
}

/// One negotiated peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self) -> Result<()>;
}

/// Creates one transport per viewer leg
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        viewer_id: &ViewerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

/// Requested capture shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30.0,
        }
    }
}

impl fmt::Display for CaptureConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{:.1}", self.width, self.height, self.frame_rate)
    }
}

/// The broadcaster's local media capture device
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Whether a media source is currently granted and producing tracks
    fn is_available(&self) -> bool;

    fn tracks(&self) -> Vec<MediaTrackInfo>;

    fn constraints(&self) -> CaptureConstraints;

    /// Advisory; the device may refuse or clamp the request
    async fn apply_constraints(&self, constraints: CaptureConstraints) -> Result<()>;
}

/// The viewer's outbound audio leg used by the mic sub-protocol
#[async_trait]
pub trait LocalAudio: Send + Sync {
    /// Attach the microphone track to the outbound leg
    async fn attach(&self) -> Result<()>;

    /// Toggle the outbound track without renegotiating
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_shape() {
        let desc = SessionDescription::new(SdpType::Answer, "v=0");
        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["sdp"], "v=0");
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let value = serde_json::to_value(IceCandidate::new("candidate:1")).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());
    }
}
