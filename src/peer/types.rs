use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::add_ice_url_scheme;

/// Kind of a session description
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged over signaling: `{ "type", "sdp" }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's JSON shape
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
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
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// `host`, `srflx`, `prflx` or `relay`, read from the `typ` attribute
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

/// Transport a relay descriptor is reached over
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayTransport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

/// One relay (TURN) or discovery (STUN) server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    pub address: String,
    #[serde(default)]
    pub transport: RelayTransport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl RelayDescriptor {
    pub fn stun(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            transport: RelayTransport::Udp,
            username: None,
            credential: None,
        }
    }

    /// True for TURN servers, which can forward media
    pub fn is_relay(&self) -> bool {
        self.address.starts_with("turn:")
            || self.address.starts_with("turns:")
            || (!self.address.starts_with("stun:") && self.username.is_some())
    }

    /// Fully qualified ICE url (`stun:`, `turn:` or `turns:`)
    pub fn ice_url(&self) -> String {
        add_ice_url_scheme(self)
    }
}

/// Ordered relay descriptors with the window they may be used in
#[derive(Debug, Clone)]
pub struct RelayDescriptorSet {
    pub descriptors: Vec<RelayDescriptor>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl RelayDescriptorSet {
    pub fn new(descriptors: Vec<RelayDescriptor>, ttl: Duration) -> Self {
        Self {
            descriptors,
            fetched_at: Utc::now(),
            ttl,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn has_relay(&self) -> bool {
        self.descriptors.iter().any(RelayDescriptor::is_relay)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.fetched_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }
}
