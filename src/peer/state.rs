use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Signaling sub-state of the negotiation with the current partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// No peer connection
    Idle,
    /// Connection built, local offer about to be created
    AwaitingLocalOffer,
    /// Local offer published, answer pending
    OfferSent,
    /// Remote answer applied, buffered candidates being flushed
    AnswerReceived,
    /// Both descriptions applied; media may flow
    Stable,
    /// Connection torn down
    Closed,
}

impl NegotiationState {
    /// `OfferSent` doubles as the "awaiting answer" state
    pub fn is_awaiting_answer(self) -> bool {
        self == NegotiationState::OfferSent
    }

    /// States in which a remote offer can be applied without glare
    pub fn accepts_remote_offer(self) -> bool {
        matches!(
            self,
            NegotiationState::Idle | NegotiationState::AnswerReceived | NegotiationState::Stable
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingLocalOffer => "awaiting_local_offer",
            NegotiationState::OfferSent => "offer_sent",
            NegotiationState::AnswerReceived => "answer_received",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of a glare keeps its offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Roll back the local offer and answer the remote one
    Yield,
    /// Ignore the remote offer and wait for our answer
    Ignore,
}

/// The lexicographically smaller id yields. An unknown local id yields too,
/// since it cannot win a comparison the remote side can reproduce.
pub fn resolve_glare(local_id: Option<&str>, remote_id: &str) -> GlareOutcome {
    match local_id {
        Some(local) if local > remote_id => GlareOutcome::Ignore,
        _ => GlareOutcome::Yield,
    }
}

/// Wait before a disconnected ICE transport is declared failed
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);
