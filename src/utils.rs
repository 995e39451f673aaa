use crate::peer::types::{RelayDescriptor, RelayTransport};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Adds the ICE url scheme to a relay address when it is missing
pub fn add_ice_url_scheme(desc: &RelayDescriptor) -> String {
    if desc.address.starts_with("turn:")
        || desc.address.starts_with("turns:")
        || desc.address.starts_with("stun:")
    {
        return desc.address.clone();
    }

    // Credentials mean a TURN server; bare addresses are STUN
    match (desc.username.is_some(), desc.transport) {
        (false, _) => format!("stun:{}", desc.address),
        (true, RelayTransport::Udp) => format!("turn:{}", desc.address),
        (true, RelayTransport::Tcp) => format!("turn:{}?transport=tcp", desc.address),
        (true, RelayTransport::Tls) => format!("turns:{}?transport=tcp", desc.address),
    }
}
