//! Session controller: the single loop that owns the session and the engine
//!
//! UI commands, decoded signaling events, peer callbacks and preparation
//! results are all funneled into one queue and handled one at a time.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::events::{UiEvent, UiNotifier};
use crate::media::MediaCapture;
use crate::peer::connection::PeerEvent;
use crate::peer::negotiation::{
    EngineConfig, EngineDeps, NegotiationEngine, Preparation, Prepared,
};
use crate::peer::state::NegotiationState;
use crate::session::{ConnectionStatus, Session};
use crate::signaling::protocol::{
    InboundSignal, CLIENT_DISCONNECT_REASON, FIND_MATCH, INBOUND_EVENTS, MESSAGE, NEXT,
};
use crate::signaling::{SignalingChannel, Signaler};
use crate::{Error, Result};

/// Requests from the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FindMatch,
    Next,
    SendChat(String),
    Shutdown,
}

#[derive(Debug)]
pub enum Input {
    Command(Command),
    Signal(InboundSignal),
    Peer(PeerEvent),
    Prepared(Prepared),
}

/// Read-only view published after every handled input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub session_status: ConnectionStatus,
    pub local_id: Option<String>,
    pub partner_id: Option<String>,
    pub negotiation_state: NegotiationState,
    /// A match has been requested and not yet found
    pub searching: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            session_status: ConnectionStatus::Disconnected,
            local_id: None,
            partner_id: None,
            negotiation_state: NegotiationState::Idle,
            searching: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerOptions {
    pub requeue_on_next: bool,
}

pub struct Controller {
    engine: NegotiationEngine,
    session: Session,
    signaler: Arc<dyn Signaler>,
    media: Arc<dyn MediaCapture>,
    notifier: UiNotifier,
    options: ControllerOptions,
    /// Wants a partner; `find_match` is (re)sent whenever the channel connects
    waiting: bool,
    inputs: mpsc::UnboundedSender<Input>,
    input_rx: mpsc::UnboundedReceiver<Input>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    snapshot: watch::Sender<Snapshot>,
}

impl Controller {
    pub fn new(
        deps: EngineDeps,
        engine_config: EngineConfig,
        options: ControllerOptions,
        notifier: UiNotifier,
    ) -> Self {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(Snapshot::default());
        let signaler = deps.signaler.clone();
        let media = deps.media.clone();
        let engine = NegotiationEngine::new(deps, engine_config, notifier.clone(), peer_tx);

        Self {
            engine,
            session: Session::new(),
            signaler,
            media,
            notifier,
            options,
            waiting: false,
            inputs,
            input_rx,
            peer_rx,
            snapshot,
        }
    }

    pub fn inputs(&self) -> mpsc::UnboundedSender<Input> {
        self.inputs.clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session_status: self.session.status(),
            local_id: self.session.local_id().map(str::to_string),
            partner_id: self.engine.partner_id().map(str::to_string),
            negotiation_state: self.engine.state(),
            searching: self.waiting,
        }
    }

    /// Marks the session as dialing; call before connecting the channel
    pub fn set_connecting(&mut self) {
        self.session.connecting();
        self.publish();
    }

    pub async fn run(mut self) {
        info!("Session controller started");
        while self.step().await {}
        info!("Session controller stopped");
    }

    /// Handles one input. Returns `false` once the controller should stop.
    pub async fn step(&mut self) -> bool {
        let input = tokio::select! {
            Some(input) = self.input_rx.recv() => input,
            Some(event) = self.peer_rx.recv() => Input::Peer(event),
            else => return false,
        };
        let keep_running = self.handle(input).await;
        self.publish();
        keep_running
    }

    pub async fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(command) => return self.on_command(command).await,
            Input::Signal(signal) => self.on_signal(signal).await,
            Input::Peer(event) => {
                if let Err(e) = self.engine.on_peer_event(event).await {
                    debug!("peer event ended the negotiation: {}", e);
                }
            }
            Input::Prepared(prepared) => {
                if let Err(e) = self.engine.on_prepared(prepared).await {
                    debug!("preparation ended the negotiation: {}", e);
                }
            }
        }
        true
    }

    async fn on_command(&mut self, command: Command) -> bool {
        debug!("command: {:?}", command);
        match command {
            Command::FindMatch => {
                if let Some(partner) = self.engine.partner_id() {
                    info!("Already matched with {}, find_match ignored", partner);
                } else {
                    self.request_match();
                }
            }
            Command::Next => {
                if let Some(partner) = self.engine.teardown().await {
                    info!("Leaving {}", partner);
                }
                self.send(NEXT, None);
                if self.options.requeue_on_next {
                    self.request_match();
                } else {
                    self.waiting = false;
                }
            }
            Command::SendChat(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return true;
                }
                self.send(MESSAGE, Some(Value::String(text.to_string())));
                self.notifier.emit(UiEvent::ChatMessage {
                    text: text.to_string(),
                    from_self: true,
                });
            }
            Command::Shutdown => {
                self.waiting = false;
                self.engine.teardown().await;
                return false;
            }
        }
        true
    }

    async fn on_signal(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::Connected { local_id } => {
                info!("Signaling session established as {}", local_id);
                self.session.connected(local_id.clone());
                self.engine.set_local_id(Some(local_id));
                self.notifier.emit(UiEvent::StatusChanged {
                    status: ConnectionStatus::Connected,
                });
                if self.waiting {
                    self.request_match();
                }
            }
            InboundSignal::Disconnected { reason } => {
                self.session.disconnected();
                self.engine.set_local_id(None);
                self.notifier.emit(UiEvent::StatusChanged {
                    status: ConnectionStatus::Disconnected,
                });

                if reason == CLIENT_DISCONNECT_REASON {
                    info!("Signaling closed locally");
                    return;
                }
                warn!("Signaling lost ({}), waiting for reconnect", reason);
                self.session.connecting();
                self.notifier
                    .failure(&Error::Channel(format!("signaling lost: {}", reason)));
                if let Some(partner) = self.engine.teardown().await {
                    info!("Call with {} abandoned after channel loss", partner);
                    self.notifier.emit(UiEvent::PartnerLeft {
                        partner_id: partner,
                    });
                    self.waiting = true;
                }
            }
            InboundSignal::MatchFound { partner_id } => {
                info!("Matched with {}", partner_id);
                self.waiting = false;
                self.notifier.emit(UiEvent::PartnerFound {
                    partner_id: partner_id.clone(),
                });
                if let Some(preparation) = self.engine.start_call(&partner_id).await {
                    self.spawn_preparation(preparation);
                }
            }
            InboundSignal::Offer(offer) => {
                let had_partner = self.engine.partner_id().is_some();
                match self.engine.on_offer(offer).await {
                    Ok(Some(preparation)) => {
                        if !had_partner {
                            if let Some(partner) = self.engine.partner_id() {
                                self.waiting = false;
                                self.notifier.emit(UiEvent::PartnerFound {
                                    partner_id: partner.to_string(),
                                });
                            }
                        }
                        self.spawn_preparation(preparation);
                    }
                    Ok(None) => {}
                    Err(e) => debug!("offer ended the negotiation: {}", e),
                }
            }
            InboundSignal::Answer(answer) => {
                if let Err(e) = self.engine.on_answer(answer).await {
                    debug!("answer ended the negotiation: {}", e);
                }
            }
            InboundSignal::IceCandidate(candidate) => {
                self.engine.on_remote_candidate(candidate).await;
            }
            InboundSignal::PartnerLeft => match self.engine.teardown().await {
                Some(partner) => {
                    info!("Partner {} left, rejoining the queue", partner);
                    self.notifier.emit(UiEvent::PartnerLeft {
                        partner_id: partner,
                    });
                    self.request_match();
                }
                None => debug!("partner-left notice without a partner"),
            },
            InboundSignal::Chat { text } => {
                self.notifier.emit(UiEvent::ChatMessage {
                    text,
                    from_self: false,
                });
            }
        }
    }

    fn request_match(&mut self) {
        self.waiting = true;
        if self.session.status() == ConnectionStatus::Connected {
            self.send(FIND_MATCH, None);
            self.notifier.emit(UiEvent::Searching);
        } else {
            info!("Match requested while offline; will ask once connected");
        }
    }

    fn spawn_preparation(&self, preparation: Preparation) {
        let inputs = self.inputs.clone();
        let media = self.media.clone();
        tokio::spawn(async move {
            let prepared = preparation.await;
            if let Err(mpsc::error::SendError(Input::Prepared(prepared))) =
                inputs.send(Input::Prepared(prepared))
            {
                debug!("controller gone, closing orphaned connection");
                if let Ok(peer) = prepared.outcome {
                    if let Err(e) = peer.pc.close().await {
                        warn!("Error closing orphaned connection: {}", e);
                    }
                    media.release(peer.media).await;
                }
            }
        });
    }

    fn send(&self, event: &str, payload: Option<Value>) {
        if let Err(e) = self.signaler.send(event, payload) {
            warn!("Failed to send '{}': {}", event, e);
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Registers a forwarding handler on `channel` for every inbound event
pub fn bind_channel(
    channel: &SignalingChannel,
    inputs: mpsc::UnboundedSender<Input>,
) -> Result<()> {
    for &event in INBOUND_EVENTS {
        let inputs = inputs.clone();
        channel.on(event, move |payload| match InboundSignal::parse(event, payload) {
            Ok(Some(signal)) => {
                if inputs.send(Input::Signal(signal)).is_err() {
                    debug!("controller gone, '{}' dropped", event);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Protocol violation: {}", e),
        })?;
    }
    Ok(())
}
