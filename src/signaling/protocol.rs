//! Signaling events exchanged with the rendezvous server

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::types::{IceCandidate, SessionDescription};
use crate::{Error, Result};

pub const FIND_MATCH: &str = "find_match";
pub const MATCH_FOUND: &str = "match_found";
pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const ICE_CANDIDATE: &str = "ice-candidate";
pub const DISCONNECT_PEER: &str = "disconnect_peer";
pub const NEXT: &str = "next";
pub const MESSAGE: &str = "message";

/// Local lifecycle events raised by the channel itself
pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";

/// Reason reported when the client closes the channel on purpose
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

/// Every event the client consumes, in registration order
pub const INBOUND_EVENTS: &[&str] = &[
    CONNECT,
    DISCONNECT,
    MATCH_FOUND,
    OFFER,
    ANSWER,
    ICE_CANDIDATE,
    DISCONNECT_PEER,
    MESSAGE,
];

/// `offer` payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// `answer` payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// `ice-candidate` payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Connected { local_id: String },
    Disconnected { reason: String },
    MatchFound { partner_id: String },
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(CandidatePayload),
    PartnerLeft,
    Chat { text: String },
}

impl InboundSignal {
    /// Decodes a named event. Unknown events yield `Ok(None)`.
    pub fn parse(event: &str, payload: Option<Value>) -> Result<Option<Self>> {
        let signal = match event {
            CONNECT => {
                let local_id = payload
                    .as_ref()
                    .and_then(|p| p.get("sid"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| missing(event, "sid"))?;
                InboundSignal::Connected {
                    local_id: local_id.to_string(),
                }
            }
            DISCONNECT => InboundSignal::Disconnected {
                reason: payload
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or("transport close")
                    .to_string(),
            },
            MATCH_FOUND => InboundSignal::MatchFound {
                partner_id: partner_id_of(payload.as_ref()).ok_or_else(|| missing(event, "partnerId"))?,
            },
            OFFER => InboundSignal::Offer(decode(event, payload)?),
            ANSWER => InboundSignal::Answer(decode(event, payload)?),
            ICE_CANDIDATE => InboundSignal::IceCandidate(decode(event, payload)?),
            DISCONNECT_PEER => InboundSignal::PartnerLeft,
            MESSAGE => InboundSignal::Chat {
                text: match payload {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            },
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }
}

fn partner_id_of(payload: Option<&Value>) -> Option<String> {
    match payload? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(map) => map
            .get("partnerId")
            .or_else(|| map.get("partner_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, payload: Option<Value>) -> Result<T> {
    let payload = payload.ok_or_else(|| missing(event, "payload"))?;
    serde_json::from_value(payload)
        .map_err(|e| Error::ProtocolViolation(format!("malformed {} payload: {}", event, e)))
}

fn missing(event: &str, field: &str) -> Error {
    Error::ProtocolViolation(format!("{} event without {}", event, field))
}
