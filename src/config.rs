// Client configuration, filled from the command line in the binary

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::media::MediaConsent;
use crate::peer::negotiation::EngineConfig;
use crate::peer::types::RelayDescriptor;
use crate::relay::RelayPolicy;
use crate::signaling::ChannelOptions;
use crate::{Error, Result};

pub const DEFAULT_SIGNALING_URL: &str = "https://omegle-backend-sq4d.onrender.com";
pub const DEFAULT_RELAY_URL: &str = "https://omegle-backend-sq4d.onrender.com/getIceServers";
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun1.l.google.com:19302"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling_url: String,
    /// `None` disables the fetch; only `stun_servers` are used
    pub relay_url: Option<String>,
    pub require_relay: bool,
    pub relay_timeout_ms: u64,
    pub relay_ttl_secs: u64,
    pub stun_servers: Vec<String>,
    pub grace_period_secs: u64,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    /// Send `find_match` right after a user-initiated `next`
    pub requeue_on_next: bool,
    pub audio: bool,
    pub video: bool,
    pub log_filter: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            relay_url: Some(DEFAULT_RELAY_URL.to_string()),
            require_relay: false,
            relay_timeout_ms: 5_000,
            relay_ttl_secs: 300,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            grace_period_secs: 10,
            reconnect_delay_ms: 500,
            reconnect_delay_max_ms: 10_000,
            requeue_on_next: false,
            audio: true,
            video: true,
            log_filter: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.signaling_url.trim().is_empty() {
            return Err(Error::InvalidConfig("signaling url is empty".to_string()));
        }
        crate::signaling::codec::endpoint_url(&self.signaling_url)?;

        if let Some(relay_url) = &self.relay_url {
            url::Url::parse(relay_url)
                .map_err(|e| Error::InvalidConfig(format!("bad relay url: {}", e)))?;
        }
        if self.require_relay && self.relay_url.is_none() {
            return Err(Error::InvalidConfig(
                "require_relay needs a relay url".to_string(),
            ));
        }
        if self.relay_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "relay timeout must be positive".to_string(),
            ));
        }
        if self.reconnect_delay_ms == 0 || self.reconnect_delay_max_ms < self.reconnect_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "invalid reconnect delays {}ms..{}ms",
                self.reconnect_delay_ms, self.reconnect_delay_max_ms
            )));
        }
        if !self.audio && !self.video {
            return Err(Error::InvalidConfig(
                "at least one of audio or video must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn relay_ttl(&self) -> Duration {
        Duration::from_secs(self.relay_ttl_secs)
    }

    pub fn stun_descriptors(&self) -> Vec<RelayDescriptor> {
        self.stun_servers
            .iter()
            .map(|s| RelayDescriptor::stun(s.as_str()))
            .collect()
    }

    pub fn media_consent(&self) -> MediaConsent {
        MediaConsent {
            audio: self.audio,
            video: self.video,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            relay_policy: RelayPolicy {
                require_relay: self.require_relay,
            },
            fallback_relays: self.stun_descriptors(),
            relay_timeout: self.relay_timeout(),
            grace_period: Duration::from_secs(self.grace_period_secs),
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            url: self.signaling_url.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            reconnect_delay_max: Duration::from_millis(self.reconnect_delay_max_ms),
            ..ChannelOptions::new(self.signaling_url.clone())
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "matchcall")]
#[command(about = "Anonymous random-partner audio/video calls")]
pub struct Args {
    /// Socket.IO matchmaking server
    #[arg(long, env = "MATCHCALL_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    pub signaling_url: String,

    /// Endpoint returning the ICE server list
    #[arg(long, env = "MATCHCALL_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    /// Skip the relay fetch and use only STUN servers
    #[arg(long, conflicts_with = "require_relay")]
    pub no_relay: bool,

    /// Abort the call when no TURN relay is available
    #[arg(long)]
    pub require_relay: bool,

    #[arg(long, default_value_t = 5_000)]
    pub relay_timeout_ms: u64,

    /// How long fetched relay credentials are reused
    #[arg(long, default_value_t = 300)]
    pub relay_ttl_secs: u64,

    /// Public STUN server (host:port), repeatable
    #[arg(long = "stun-server")]
    pub stun_servers: Vec<String>,

    #[arg(long, default_value_t = 10)]
    pub grace_period_secs: u64,

    #[arg(long, default_value_t = 500)]
    pub reconnect_delay_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    pub reconnect_delay_max_ms: u64,

    /// Rejoin the queue immediately after `next`
    #[arg(long)]
    pub requeue_on_next: bool,

    #[arg(long)]
    pub no_audio: bool,

    #[arg(long)]
    pub no_video: bool,

    /// tracing filter; RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl From<Args> for ClientConfig {
    fn from(args: Args) -> Self {
        let stun_servers = if args.stun_servers.is_empty() {
            ClientConfig::default().stun_servers
        } else {
            args.stun_servers
        };
        Self {
            signaling_url: args.signaling_url,
            relay_url: (!args.no_relay).then_some(args.relay_url),
            require_relay: args.require_relay,
            relay_timeout_ms: args.relay_timeout_ms,
            relay_ttl_secs: args.relay_ttl_secs,
            stun_servers,
            grace_period_secs: args.grace_period_secs,
            reconnect_delay_ms: args.reconnect_delay_ms,
            reconnect_delay_max_ms: args.reconnect_delay_max_ms,
            requeue_on_next: args.requeue_on_next,
            audio: !args.no_audio,
            video: !args.no_video,
            log_filter: args.log_filter,
        }
    }
}
