//! Error types for the session core

use thiserror::Error;

use crate::lifecycle::StreamState;
use crate::peer::SessionState;
use crate::types::ViewerId;

/// Why an offer (or re-offer) was refused before reaching the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferRejection {
    /// A previous offer is still awaiting its answer and is younger than the duplicate window
    DuplicateInFlight,
    /// The session already reached `failed` or `closed`
    SessionTerminated,
    /// The broadcaster has no local media to offer
    NoLocalMedia,
}

impl std::fmt::Display for OfferRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateInFlight => write!(f, "an offer is already in flight"),
            Self::SessionTerminated => write!(f, "session is failed or closed"),
            Self::NoLocalMedia => write!(f, "no local media available"),
        }
    }
}

/// Session core error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Session already exists: {0}")]
    AlreadyExists(ViewerId),

    #[error("Room is not live")]
    RoomNotLive,

    #[error("Session not found: {0}")]
    SessionNotFound(ViewerId),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Offer rejected: {0}")]
    OfferRejected(OfferRejection),

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Recovery exhausted after {attempts} reconnection attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("Invalid stream transition: {from} -> {to}")]
    InvalidTransition { from: StreamState, to: StreamState },

    #[error("Illegal session transition for {viewer_id}: {from} -> {to}")]
    IllegalSessionTransition {
        viewer_id: ViewerId,
        from: SessionState,
        to: SessionState,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Room-wide failures escalate to the stream lifecycle; everything else
    /// stays contained at the session boundary.
    #[must_use]
    pub const fn is_room_fatal(&self) -> bool {
        matches!(
            self,
            Self::CaptureUnavailable(_) | Self::RecoveryExhausted { .. }
        )
    }
}

/// Result type for session core operations
pub type Result<T> = std::result::Result<T, Error>;
