//! Error types for the call client

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the signaling channel, relay provider, media capture and
/// the negotiation engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signaling transport lost or unusable; recovered by reconnecting
    #[error("Channel error: {0}")]
    Channel(String),

    /// Relay descriptor fetch failed, was malformed or returned nothing
    #[error("Credential fetch error: {0}")]
    CredentialFetch(String),

    /// Offer/answer/candidate arrived in a state that cannot accept it
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Camera or microphone unavailable or denied
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// ICE or description exchange failed for the current partner
    #[error("Negotiation failure: {0}")]
    NegotiationFailure(String),

    /// Peer connection could not be constructed
    #[error("Failed to create peer connection: {0}")]
    CreatePeerConnectionFailed(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient errors that the channel recovers from on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Channel(_) | Error::Io(_))
    }

    /// Errors the user has to act on (grant access, press next)
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Error::MediaAccess(_)
                | Error::NegotiationFailure(_)
                | Error::CreatePeerConnectionFailed(_)
        )
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}
