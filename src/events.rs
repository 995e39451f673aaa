//! Notifications delivered to the UI collaborator

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::ConnectionStatus;
use crate::Error;

/// Coarse failure category shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Camera or microphone unavailable; needs new consent
    MediaAccess,
    /// The call could not be established; `next` to retry
    Negotiation,
    /// Signaling transport trouble; retried automatically
    Channel,
    Other,
}

impl FailureKind {
    pub fn of(err: &Error) -> Self {
        match err {
            Error::MediaAccess(_) => FailureKind::MediaAccess,
            Error::NegotiationFailure(_) | Error::CreatePeerConnectionFailed(_) => {
                FailureKind::Negotiation
            }
            Error::Channel(_) => FailureKind::Channel,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    StatusChanged {
        status: ConnectionStatus,
    },
    /// Waiting in the match queue
    Searching,
    PartnerFound {
        partner_id: String,
    },
    CallConnected {
        partner_id: String,
    },
    ConnectionProblem {
        partner_id: String,
    },
    ConnectionRecovered {
        partner_id: String,
    },
    RemoteStreamAvailable {
        partner_id: String,
        track_id: String,
        kind: String,
    },
    PartnerLeft {
        partner_id: String,
    },
    ChatMessage {
        text: String,
        from_self: bool,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

/// Cloneable sending half for [`UiEvent`]s
#[derive(Debug, Clone)]
pub struct UiNotifier {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UiEvent) {
        debug!("ui event: {:?}", event);
        if self.tx.send(event).is_err() {
            debug!("ui receiver dropped, event discarded");
        }
    }

    pub fn failure(&self, err: &Error) {
        self.emit(UiEvent::Failure {
            kind: FailureKind::of(err),
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            FailureKind::of(&Error::MediaAccess("denied".into())),
            FailureKind::MediaAccess
        );
        assert_eq!(
            FailureKind::of(&Error::CreatePeerConnectionFailed("x".into())),
            FailureKind::Negotiation
        );
        assert_eq!(
            FailureKind::of(&Error::Channel("x".into())),
            FailureKind::Channel
        );
    }

    #[test]
    fn test_event_serialization() {
        let ev = UiEvent::PartnerFound {
            partner_id: "abc".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            serde_json::json!({ "type": "partner_found", "partner_id": "abc" })
        );
    }

    #[tokio::test]
    async fn test_notifier_delivers_in_order() {
        let (notifier, mut rx) = UiNotifier::new();
        notifier.emit(UiEvent::Searching);
        notifier.failure(&Error::NegotiationFailure("ice failed".into()));
        assert_eq!(rx.recv().await, Some(UiEvent::Searching));
        match rx.recv().await {
            Some(UiEvent::Failure { kind, message }) => {
                assert_eq!(kind, FailureKind::Negotiation);
                assert!(message.contains("ice failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
