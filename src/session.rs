use serde::Serialize;
use std::fmt;

/// Signaling connectivity as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// The client's identity on the signaling server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    local_id: Option<String>,
    status: ConnectionStatus,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// The server assigns a fresh id on every (re)connect
    pub fn connected(&mut self, local_id: impl Into<String>) {
        self.local_id = Some(local_id.into());
        self.status = ConnectionStatus::Connected;
    }

    pub fn disconnected(&mut self) {
        self.local_id = None;
        self.status = ConnectionStatus::Disconnected;
    }
}
