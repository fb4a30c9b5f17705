//! Room-scoped signaling: message model, channel abstraction and the in-process hub

mod channel;
mod hub;
mod messages;

pub use channel::{LocalSignalingChannel, SignalEvent, SignalingChannel};
pub use hub::{EnvelopeSender, Role, SignalingHub};
pub use messages::{SignalEnvelope, SignalMessage};
