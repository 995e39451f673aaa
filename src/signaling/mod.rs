pub mod channel;
pub mod codec;
pub mod protocol;

use serde::Serialize;
use serde_json::Value;

use crate::Result;

pub use channel::{ChannelOptions, SignalingChannel};
pub use protocol::InboundSignal;

/// Outbound half of the signaling channel
pub trait Signaler: Send + Sync {
    /// Fire-and-forget enqueue of a named event
    fn send(&self, event: &str, payload: Option<Value>) -> Result<()>;
}

/// Serializes `payload` and sends it as `event`
pub fn emit<T: Serialize>(signaler: &dyn Signaler, event: &str, payload: &T) -> Result<()> {
    signaler.send(event, Some(serde_json::to_value(payload)?))
}
