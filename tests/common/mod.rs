#![allow(dead_code)]

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use matchcall_lib::events::{UiEvent, UiNotifier};
use matchcall_lib::media::{LocalMedia, MediaCapture};
use matchcall_lib::peer::connection::{PeerConnection, PeerEvent, PeerFactory, PeerSetup};
use matchcall_lib::peer::negotiation::{EngineConfig, EngineDeps, NegotiationEngine};
use matchcall_lib::peer::types::{
    IceCandidate, RelayDescriptor, RelayDescriptorSet, RelayTransport, SessionDescription,
};
use matchcall_lib::relay::RelayProvider;
use matchcall_lib::signaling::Signaler;
use matchcall_lib::{Error, Result};

#[derive(Default)]
pub struct FakeSignaler {
    sent: Mutex<Vec<(String, Option<Value>)>>,
}

impl FakeSignaler {
    pub fn events(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    /// Payloads of every `event`, decoded
    pub fn payloads<T: DeserializeOwned>(&self, event: &str) -> Vec<T> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .filter_map(|(_, p)| p.clone())
            .map(|p| serde_json::from_value(p).unwrap())
            .collect()
    }

    pub fn last<T: DeserializeOwned>(&self, event: &str) -> T {
        self.payloads(event).pop().unwrap()
    }

    pub fn raw(&self) -> Vec<(String, Option<Value>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Signaler for FakeSignaler {
    fn send(&self, event: &str, payload: Option<Value>) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
        Ok(())
    }
}

#[derive(Default, Debug)]
pub struct PeerLog {
    pub local: Vec<SessionDescription>,
    pub remote: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub rollbacks: usize,
    pub tracks: usize,
    pub closed: bool,
}

pub struct FakePeer {
    name: String,
    offers: AtomicUsize,
    pub log: Mutex<PeerLog>,
}

impl FakePeer {
    pub fn closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    pub fn local(&self) -> Vec<SessionDescription> {
        self.log.lock().unwrap().local.clone()
    }

    pub fn remote(&self) -> Vec<SessionDescription> {
        self.log.lock().unwrap().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.log.lock().unwrap().candidates.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.log.lock().unwrap().rollbacks
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        self.log.lock().unwrap().tracks += media.track_count();
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{}-{}", self.name, n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-{}", self.name)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.lock().unwrap().local.push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.lock().unwrap().remote.push(desc);
        Ok(())
    }

    async fn rollback_local_offer(&self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.rollbacks += 1;
        log.local.pop();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.log.lock().unwrap().candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

pub struct FakeFactory {
    name: String,
    pub created: Mutex<Vec<Arc<FakePeer>>>,
    pub fail: bool,
}

impl FakeFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self, setup: PeerSetup) -> Result<Arc<dyn PeerConnection>> {
        if self.fail {
            return Err(Error::CreatePeerConnectionFailed("factory says no".into()));
        }
        let peer = Arc::new(FakePeer {
            name: format!("{}-{}", self.name, setup.generation),
            offers: AtomicUsize::new(0),
            log: Mutex::new(PeerLog::default()),
        });
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub deny: bool,
}

impl FakeMedia {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeMedia {
    async fn acquire(&self) -> Result<LocalMedia> {
        if self.deny {
            return Err(Error::MediaAccess("camera denied".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia::empty("fake-stream"))
    }

    async fn release(&self, media: LocalMedia) {
        media.mark_released();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub enum FakeRelays {
    Turn,
    Empty,
}

#[async_trait]
impl RelayProvider for FakeRelays {
    async fn fetch_descriptors(&self, _timeout: Duration) -> Result<RelayDescriptorSet> {
        match self {
            FakeRelays::Turn => Ok(RelayDescriptorSet::new(
                vec![RelayDescriptor {
                    address: "turn.example.org:3478".into(),
                    transport: RelayTransport::Udp,
                    username: Some("user".into()),
                    credential: Some("pass".into()),
                }],
                Duration::from_secs(60),
            )),
            FakeRelays::Empty => Err(Error::CredentialFetch("empty relay list".into())),
        }
    }
}

/// One side of a call under test
pub struct Side {
    pub engine: NegotiationEngine,
    pub signaler: Arc<FakeSignaler>,
    pub factory: Arc<FakeFactory>,
    pub media: Arc<FakeMedia>,
    pub ui: mpsc::UnboundedReceiver<UiEvent>,
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

pub struct SideBuilder {
    name: String,
    relays: FakeRelays,
    config: EngineConfig,
    deny_media: bool,
    failing_factory: bool,
}

impl SideBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            relays: FakeRelays::Turn,
            config: EngineConfig::default(),
            deny_media: false,
            failing_factory: false,
        }
    }

    pub fn relays(mut self, relays: FakeRelays) -> Self {
        self.relays = relays;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn deny_media(mut self) -> Self {
        self.deny_media = true;
        self
    }

    pub fn failing_factory(mut self) -> Self {
        self.failing_factory = true;
        self
    }

    pub fn build(self) -> Side {
        let signaler = Arc::new(FakeSignaler::default());
        let mut factory = FakeFactory::new(&self.name);
        factory.fail = self.failing_factory;
        let factory = Arc::new(factory);
        let media = Arc::new(FakeMedia {
            deny: self.deny_media,
            ..Default::default()
        });
        let deps = EngineDeps {
            relays: Arc::new(self.relays),
            media: media.clone(),
            peers: factory.clone(),
            signaler: signaler.clone(),
        };
        let (notifier, ui) = UiNotifier::new();
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let mut engine = NegotiationEngine::new(deps, self.config, notifier, peer_tx);
        engine.set_local_id(Some(self.name.clone()));

        Side {
            engine,
            signaler,
            factory,
            media,
            ui,
            peer_events,
        }
    }
}

impl Side {
    pub fn new(name: &str) -> Self {
        SideBuilder::new(name).build()
    }

    /// Runs `start_call` and its preparation to completion
    pub async fn call(&mut self, partner: &str) -> Result<()> {
        let prep = self.engine.start_call(partner).await.expect("preparation");
        let prepared = prep.await;
        self.engine.on_prepared(prepared).await
    }

    pub fn drain_ui(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = self.ui.try_recv() {
            events.push(ev);
        }
        events
    }
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
