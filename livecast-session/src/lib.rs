//! Live broadcast session core
//!
//! One broadcaster streams to many viewers over per-viewer peer sessions.
//! The crate negotiates those sessions over a room-scoped signaling channel,
//! keeps them healthy, adapts capture quality, reconnects with backoff, and
//! falls back to a snapshot-then-stop recovery when reconnection is exhausted.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod logging;
pub mod mic;
pub mod peer;
pub mod quality;
pub mod reconnect;
pub mod registry;
pub mod rtc;
pub mod signaling;
pub mod snapshot;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod types;
pub mod viewer;

pub use broadcast::{BroadcastServices, BroadcastSession, OperatorEvent};
pub use config::Config;
pub use error::{Error, OfferRejection, Result};
pub use health::{ConnectionHealth, ConnectionStats, HealthMonitor, QualityTier};
pub use lifecycle::{Room, StateChange, StreamLifecycle, StreamState};
pub use mic::{MicRequest, MicRequestBook, MicStatus};
pub use peer::{PeerSession, SessionState};
pub use quality::{QualityAction, QualityController};
pub use reconnect::{FailureScope, ReconnectEvent, ReconnectionManager};
pub use registry::{RecreateReport, SessionRegistry};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use signaling::{
    LocalSignalingChannel, Role, SignalEnvelope, SignalEvent, SignalMessage, SignalingChannel,
    SignalingHub,
};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, RecoverySnapshot, SnapshotStore};
pub use supervisor::ResourceSupervisor;
pub use transport::{CaptureSource, LocalAudio, PeerTransport, TransportFactory};
pub use types::{OfferId, RoomId, UserInfo, ViewerId};
pub use viewer::{MicState, ViewerEvent, ViewerSession};
