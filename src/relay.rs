//! Relay (TURN/STUN) descriptor provider

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::peer::types::{RelayDescriptor, RelayDescriptorSet, RelayTransport};
use crate::{Error, Result};

/// Source of relay descriptors for new peer connections
#[async_trait]
pub trait RelayProvider: Send + Sync {
    async fn fetch_descriptors(&self, timeout: Duration) -> Result<RelayDescriptorSet>;
}

/// What to do when no relay can be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayPolicy {
    /// Abort the call attempt instead of falling back to STUN-only paths
    pub require_relay: bool,
}

/// Descriptors chosen for one peer connection
#[derive(Debug, Clone)]
pub struct RelaySelection {
    pub descriptors: RelayDescriptorSet,
    /// Restrict ICE to relay candidates
    pub relay_only: bool,
}

/// Fetches descriptors and applies `policy`.
///
/// With `require_relay` a failed, empty or relay-less fetch is fatal; the
/// result is then forced to relay-only transport. Otherwise a failure falls
/// back to `fallback`.
pub async fn select_relays(
    provider: &dyn RelayProvider,
    policy: RelayPolicy,
    fallback: &[RelayDescriptor],
    timeout: Duration,
) -> Result<RelaySelection> {
    match provider.fetch_descriptors(timeout).await {
        Ok(set) if set.is_fresh() => {
            if policy.require_relay && !set.has_relay() {
                return Err(Error::CreatePeerConnectionFailed(
                    "relay required but no TURN descriptor was provided".to_string(),
                ));
            }
            Ok(RelaySelection {
                relay_only: policy.require_relay,
                descriptors: set,
            })
        }
        Ok(_) => fall_back(
            Error::CredentialFetch("relay descriptors already expired".to_string()),
            policy,
            fallback,
        ),
        Err(e) => fall_back(e, policy, fallback),
    }
}

fn fall_back(
    err: Error,
    policy: RelayPolicy,
    fallback: &[RelayDescriptor],
) -> Result<RelaySelection> {
    if policy.require_relay {
        warn!("Relay required and unavailable: {}", err);
        return Err(Error::CreatePeerConnectionFailed(err.to_string()));
    }
    warn!(
        "Relay fetch failed ({}), falling back to {} public descriptor(s)",
        err,
        fallback.len()
    );
    Ok(RelaySelection {
        descriptors: RelayDescriptorSet::new(fallback.to_vec(), Duration::MAX),
        relay_only: false,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDescriptor {
    Plain(RelayDescriptor),
    IceServer {
        urls: Urls,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        credential: Option<String>,
    },
}

/// Parses a relay endpoint response body.
///
/// Accepts `{address, transport?, username?, credential?}` entries and
/// browser-style `{urls, username?, credential?}` entries, keeping order.
pub fn parse_descriptors(body: &Value) -> Result<Vec<RelayDescriptor>> {
    let entries = body.as_array().ok_or_else(|| {
        Error::CredentialFetch(format!("expected a JSON array, got {}", kind_of(body)))
    })?;

    let mut descriptors = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw: RawDescriptor = serde_json::from_value(entry.clone())
            .map_err(|e| Error::CredentialFetch(format!("malformed descriptor: {}", e)))?;
        match raw {
            RawDescriptor::Plain(desc) => descriptors.push(desc),
            RawDescriptor::IceServer {
                urls,
                username,
                credential,
            } => {
                let urls = match urls {
                    Urls::One(url) => vec![url],
                    Urls::Many(urls) => urls,
                };
                for url in urls {
                    descriptors.push(RelayDescriptor {
                        transport: transport_of(&url),
                        address: url,
                        username: username.clone(),
                        credential: credential.clone(),
                    });
                }
            }
        }
    }

    if descriptors.is_empty() {
        return Err(Error::CredentialFetch(
            "relay endpoint returned no descriptors".to_string(),
        ));
    }
    Ok(descriptors)
}

fn transport_of(url: &str) -> RelayTransport {
    if url.starts_with("turns:") {
        RelayTransport::Tls
    } else if url.ends_with("transport=tcp") {
        RelayTransport::Tcp
    } else {
        RelayTransport::Udp
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Fetches descriptors from an HTTP endpoint and caches them while fresh
pub struct HttpRelayProvider {
    client: reqwest::Client,
    url: String,
    ttl: Duration,
    cached: Mutex<Option<RelayDescriptorSet>>,
}

impl HttpRelayProvider {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            ttl,
            cached: Mutex::new(None),
        }
    }

    fn cached_fresh(&self) -> Option<RelayDescriptorSet> {
        let guard = self.cached.lock().ok()?;
        guard.as_ref().filter(|set| set.is_fresh()).cloned()
    }

    fn store(&self, set: &RelayDescriptorSet) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(set.clone());
        }
    }
}

#[async_trait]
impl RelayProvider for HttpRelayProvider {
    async fn fetch_descriptors(&self, timeout: Duration) -> Result<RelayDescriptorSet> {
        if let Some(set) = self.cached_fresh() {
            debug!("Reusing {} cached relay descriptor(s)", set.len());
            return Ok(set);
        }

        info!("Fetching relay descriptors from {}", self.url);
        let resp = self
            .client
            .get(&self.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::CredentialFetch(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::CredentialFetch(format!(
                "relay endpoint returned {}",
                status
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::CredentialFetch(format!("invalid response body: {}", e)))?;

        let set = RelayDescriptorSet::new(parse_descriptors(&body)?, self.ttl);
        info!("Fetched {} relay descriptor(s)", set.len());
        self.store(&set);
        Ok(set)
    }
}

/// Fixed descriptor list, e.g. public STUN servers
pub struct StaticRelayProvider {
    descriptors: Vec<RelayDescriptor>,
}

impl StaticRelayProvider {
    pub fn new(descriptors: Vec<RelayDescriptor>) -> Self {
        Self { descriptors }
    }
}

#[async_trait]
impl RelayProvider for StaticRelayProvider {
    async fn fetch_descriptors(&self, _timeout: Duration) -> Result<RelayDescriptorSet> {
        if self.descriptors.is_empty() {
            return Err(Error::CredentialFetch(
                "no static descriptors configured".to_string(),
            ));
        }
        Ok(RelayDescriptorSet::new(self.descriptors.clone(), Duration::MAX))
    }
}
