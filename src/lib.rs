pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use commands::SessionHandle;
pub use config::ClientConfig;
pub use controller::{Command, Controller, ControllerOptions, Snapshot};
pub use error::{Error, Result};
pub use events::{FailureKind, UiEvent};

use media::SampleTrackCapture;
use peer::connection::RtcPeerFactory;
use peer::negotiation::EngineDeps;
use relay::{HttpRelayProvider, RelayProvider, StaticRelayProvider};
use signaling::SignalingChannel;

/// A running client: signaling channel plus session controller
pub struct Client {
    handle: SessionHandle,
    events: Option<mpsc::UnboundedReceiver<UiEvent>>,
    channel: Arc<SignalingChannel>,
    controller: JoinHandle<()>,
}

impl Client {
    /// Wires the components together and starts connecting.
    /// Must be called from within a tokio runtime.
    pub fn start(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let (notifier, events) = events::UiNotifier::new();
        let channel = Arc::new(SignalingChannel::new(config.channel_options()));

        let relays: Arc<dyn RelayProvider> = match &config.relay_url {
            Some(url) => Arc::new(HttpRelayProvider::new(url.clone(), config.relay_ttl())),
            None => Arc::new(StaticRelayProvider::new(config.stun_descriptors())),
        };
        let deps = EngineDeps {
            relays,
            media: Arc::new(SampleTrackCapture::new(config.media_consent())),
            peers: Arc::new(RtcPeerFactory),
            signaler: channel.clone(),
        };

        let mut controller = Controller::new(
            deps,
            config.engine_config(),
            ControllerOptions {
                requeue_on_next: config.requeue_on_next,
            },
            notifier,
        );
        controller::bind_channel(&channel, controller.inputs())?;
        let handle = SessionHandle::new(controller.inputs(), controller.snapshots());

        controller.set_connecting();
        channel.connect()?;
        let controller = tokio::spawn(controller.run());

        info!("Client started against {}", config.signaling_url);
        Ok(Self {
            handle,
            events: Some(events),
            channel,
            controller,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// UI notifications; can be taken once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UiEvent>> {
        self.events.take()
    }

    /// Stops the controller, then closes the signaling channel
    pub async fn shutdown(self) {
        if self.handle.shutdown().is_ok() {
            if let Err(e) = self.controller.await {
                warn!("session controller ended abnormally: {}", e);
            }
        }
        self.channel.disconnect().await;
        info!("Client stopped");
    }
}
