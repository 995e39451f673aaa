//! Reconnecting Socket.IO client used for signaling

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::codec::{self, Packet};
use super::protocol::{CLIENT_DISCONNECT_REASON, CONNECT, DISCONNECT};
use super::Signaler;
use crate::{Error, Result};

const MAX_HEARTBEAT: Duration = Duration::from_secs(24 * 60 * 60);

/// Callback invoked on the supervisor task for every inbound event
pub type EventHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

type HandlerMap = Arc<Mutex<HashMap<String, EventHandler>>>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    /// Bound on the websocket dial plus the handshake
    pub connect_timeout: Duration,
}

impl ChannelOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Supervisor {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SignalingChannel {
    options: ChannelOptions,
    handlers: HandlerMap,
    connected: Arc<AtomicBool>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl SignalingChannel {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            options,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            supervisor: Mutex::new(None),
        }
    }

    /// Starts the connection supervisor. No-op when already started.
    pub fn connect(&self) -> Result<()> {
        let mut slot = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("signaling channel already started");
            return Ok(());
        }

        let url = codec::endpoint_url(&self.options.url)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("Connecting signaling channel to {}", url);
        let task = tokio::spawn(supervise(
            url,
            self.options.clone(),
            self.handlers.clone(),
            self.connected.clone(),
            outbound_rx,
            shutdown_rx,
        ));

        *slot = Some(Supervisor {
            outbound,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Registers the single handler for `event`
    pub fn on<F>(&self, event: &str, handler: F) -> Result<()>
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(event) {
            return Err(Error::Channel(format!(
                "handler for '{}' already registered",
                event
            )));
        }
        handlers.insert(event.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stops reconnecting, closes the socket and reports `io client disconnect`.
    pub async fn disconnect(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(supervisor) = supervisor else {
            return;
        };

        let _ = supervisor.shutdown.send(true);
        if let Err(e) = supervisor.task.await {
            warn!("signaling supervisor ended abnormally: {}", e);
        }
        self.connected.store(false, Ordering::SeqCst);

        info!("Signaling channel closed by client");
        dispatch(
            &self.handlers,
            DISCONNECT,
            Some(Value::String(CLIENT_DISCONNECT_REASON.to_string())),
        );
    }
}

impl Signaler for SignalingChannel {
    fn send(&self, event: &str, payload: Option<Value>) -> Result<()> {
        let frame = codec::encode(&Packet::event(event, payload))?;
        let slot = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        let supervisor = slot
            .as_ref()
            .ok_or_else(|| Error::Channel("signaling channel not started".to_string()))?;
        supervisor
            .outbound
            .send(frame)
            .map_err(|_| Error::Channel("signaling supervisor stopped".to_string()))?;
        debug!("queued '{}'", event);
        Ok(())
    }
}

fn dispatch(handlers: &HandlerMap, event: &str, payload: Option<Value>) {
    let handler = handlers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(event)
        .cloned();
    match handler {
        Some(handler) => handler(payload),
        None => debug!("no handler for '{}'", event),
    }
}

/// Adds up to 50% random jitter to a backoff step
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 2;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Heartbeat deadline from now, clamped for absurd server intervals
fn deadline_after(heartbeat: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(heartbeat.min(MAX_HEARTBEAT)).unwrap_or(now)
}

enum SessionEnd {
    Shutdown,
    Lost { reason: String, established: bool },
}

async fn supervise(
    url: Url,
    options: ChannelOptions,
    handlers: HandlerMap,
    connected: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = options.reconnect_delay;
    loop {
        let end = run_session(
            &url,
            &options,
            &handlers,
            &connected,
            &mut outbound,
            &mut shutdown,
        )
        .await;
        connected.store(false, Ordering::SeqCst);

        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Lost {
                reason,
                established,
            } => {
                warn!("Signaling transport lost: {}", reason);
                if established {
                    backoff = options.reconnect_delay;
                    dispatch(&handlers, DISCONNECT, Some(Value::String(reason)));
                }
            }
        }

        let delay = jittered(backoff);
        backoff = backoff.saturating_mul(2).min(options.reconnect_delay_max);
        debug!("reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One websocket lifetime: dial, handshake, then pump frames until loss or shutdown
async fn run_session(
    url: &Url,
    options: &ChannelOptions,
    handlers: &HandlerMap,
    connected: &AtomicBool,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let lost = |reason: String, established: bool| SessionEnd::Lost {
        reason,
        established,
    };

    let dial = tokio::time::timeout(options.connect_timeout, connect_async(url.as_str()));
    let ws = tokio::select! {
        res = dial => match res {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return lost(format!("connect failed: {}", e), false),
            Err(_) => return lost("connect timed out".to_string(), false),
        },
        _ = shutdown.changed() => return SessionEnd::Shutdown,
    };
    let (mut sink, mut stream) = ws.split();

    let mut established = false;
    let mut engine_sid: Option<String> = None;
    let mut heartbeat = options.connect_timeout;
    let mut deadline = deadline_after(heartbeat);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if established {
                    if let Ok(frame) = codec::encode(&Packet::Disconnect) {
                        let _ = sink.send(Message::Text(frame)).await;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            _ = tokio::time::sleep_until(deadline) => {
                return lost("ping timeout".to_string(), established);
            }
            frame = outbound.recv(), if established => {
                let Some(frame) = frame else {
                    return SessionEnd::Shutdown;
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    return lost(format!("send failed: {}", e), established);
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        return lost("transport close".to_string(), established);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("binary signaling frame ignored");
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return lost(format!("transport error: {}", e), established),
                };
                deadline = deadline_after(heartbeat);

                let packet = match codec::decode(&text) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("undecodable signaling frame {:?}: {}", text, e);
                        continue;
                    }
                };

                let reply = match packet {
                    Packet::Open(info) => {
                        heartbeat = info.heartbeat_deadline();
                        deadline = deadline_after(heartbeat);
                        engine_sid = Some(info.sid);
                        Some(Packet::Connect { sid: None })
                    }
                    Packet::Ping(data) => Some(Packet::Pong(data)),
                    Packet::Connect { sid } => {
                        let Some(sid) = sid.or_else(|| engine_sid.clone()) else {
                            return lost("namespace connect without sid".to_string(), false);
                        };
                        established = true;
                        connected.store(true, Ordering::SeqCst);

                        let mut stale = 0usize;
                        while outbound.try_recv().is_ok() {
                            stale += 1;
                        }
                        if stale > 0 {
                            debug!("discarded {} frames queued while offline", stale);
                        }

                        info!("Signaling connected, sid={}", sid);
                        dispatch(handlers, CONNECT, Some(json!({ "sid": sid })));
                        None
                    }
                    Packet::Event { name, payload } => {
                        if name == CONNECT || name == DISCONNECT {
                            warn!("server sent reserved event '{}'", name);
                        } else {
                            debug!("received '{}'", name);
                            dispatch(handlers, &name, payload);
                        }
                        None
                    }
                    Packet::Disconnect => {
                        return lost("io server disconnect".to_string(), established);
                    }
                    Packet::Close => {
                        return lost("transport close".to_string(), established);
                    }
                    Packet::ConnectError(detail) => {
                        return lost(format!("connect error: {}", detail), established);
                    }
                    Packet::Pong(_) | Packet::Noop => None,
                };

                if let Some(reply) = reply {
                    match codec::encode(&reply) {
                        Ok(frame) => {
                            if let Err(e) = sink.send(Message::Text(frame)).await {
                                return lost(format!("send failed: {}", e), established);
                            }
                        }
                        Err(e) => warn!("failed to encode {:?}: {}", reply, e),
                    }
                }
            }
        }
    }
}
