pub mod connection;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod types;

pub use connection::{
    PeerConnection, PeerConnectionState, PeerEvent, PeerFactory, PeerSetup, RtcPeerFactory,
};
pub use negotiation::{EngineConfig, EngineDeps, NegotiationEngine, Preparation, Prepared};
pub use state::{NegotiationState, GRACE_PERIOD};
pub use types::{IceCandidate, RelayDescriptor, RelayDescriptorSet, SessionDescription};
