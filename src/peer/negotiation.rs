//! Offer/answer state machine for the current partner
//!
//! The engine owns at most one peer connection. Every method runs to
//! completion on the controller task; the only work done elsewhere is the
//! [`Preparation`] future returned by [`NegotiationEngine::start_call`] and
//! [`NegotiationEngine::on_offer`], whose result must be fed back through
//! [`NegotiationEngine::on_prepared`].

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{UiEvent, UiNotifier};
use crate::media::{LocalMedia, MediaCapture};
use crate::peer::connection::{
    PeerConnection, PeerConnectionState, PeerEvent, PeerEventSender, PeerFactory, PeerSetup,
};
use crate::peer::ice::{analyze_candidates, CandidateBuffer};
use crate::peer::state::{resolve_glare, GlareOutcome, NegotiationState, GRACE_PERIOD};
use crate::peer::types::{IceCandidate, RelayDescriptor, SessionDescription};
use crate::relay::{select_relays, RelayPolicy, RelayProvider};
use crate::signaling::protocol::{
    AnswerPayload, CandidatePayload, OfferPayload, ANSWER, ICE_CANDIDATE, OFFER,
};
use crate::signaling::{emit, Signaler};
use crate::{Error, Result};

/// Early candidates kept while no negotiation exists
const MAX_PARKED_CANDIDATES: usize = 64;

/// Collaborators the engine drives
#[derive(Clone)]
pub struct EngineDeps {
    pub relays: Arc<dyn RelayProvider>,
    pub media: Arc<dyn MediaCapture>,
    pub peers: Arc<dyn PeerFactory>,
    pub signaler: Arc<dyn Signaler>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub relay_policy: RelayPolicy,
    /// Used when the relay fetch fails and the policy permits it
    pub fallback_relays: Vec<RelayDescriptor>,
    pub relay_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relay_policy: RelayPolicy::default(),
            fallback_relays: vec![RelayDescriptor::stun("stun.l.google.com:19302")],
            relay_timeout: Duration::from_secs(5),
            grace_period: GRACE_PERIOD,
        }
    }
}

/// A connection built for one partner, with local media attached
pub struct PreparedPeer {
    pub pc: Arc<dyn PeerConnection>,
    pub media: LocalMedia,
}

/// Result of a [`Preparation`]
pub struct Prepared {
    pub generation: u64,
    pub partner_id: String,
    pub outcome: Result<PreparedPeer>,
}

impl fmt::Debug for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("generation", &self.generation)
            .field("partner_id", &self.partner_id)
            .field("ok", &self.outcome.is_ok())
            .finish()
    }
}

/// Relay fetch, media acquisition and connection construction, run off the
/// controller task
pub type Preparation = BoxFuture<'static, Prepared>;

/// What to do once the connection is ready
enum Intent {
    Offer,
    Answer(SessionDescription),
}

struct Negotiation {
    generation: u64,
    partner_id: String,
    state: NegotiationState,
    /// Set while the preparation is outstanding
    preparing: Option<Intent>,
    pc: Option<Arc<dyn PeerConnection>>,
    media: Option<LocalMedia>,
    remote_applied: bool,
    remote_candidates: CandidateBuffer,
    local_candidates: CandidateBuffer,
    gathered: Vec<IceCandidate>,
    grace_timer: Option<JoinHandle<()>>,
    connected_once: bool,
}

impl Negotiation {
    fn new(generation: u64, partner_id: String, intent: Intent) -> Self {
        Self {
            generation,
            partner_id,
            state: NegotiationState::Idle,
            preparing: Some(intent),
            pc: None,
            media: None,
            remote_applied: false,
            remote_candidates: CandidateBuffer::new(),
            local_candidates: CandidateBuffer::new(),
            gathered: Vec::new(),
            grace_timer: None,
            connected_once: false,
        }
    }

    fn cancel_grace_timer(&mut self) -> bool {
        match self.grace_timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

pub struct NegotiationEngine {
    deps: EngineDeps,
    config: EngineConfig,
    notifier: UiNotifier,
    events: PeerEventSender,
    local_id: Option<String>,
    generation: u64,
    current: Option<Negotiation>,
    /// State reported while no negotiation exists
    resting: NegotiationState,
    /// Set by a failed negotiation; remote offers are ignored until the user
    /// moves on
    failed: bool,
    /// Early candidates keyed by sender
    parked: Vec<(String, IceCandidate)>,
}

impl NegotiationEngine {
    pub fn new(
        deps: EngineDeps,
        config: EngineConfig,
        notifier: UiNotifier,
        events: PeerEventSender,
    ) -> Self {
        Self {
            deps,
            config,
            notifier,
            events,
            local_id: None,
            generation: 0,
            current: None,
            resting: NegotiationState::Idle,
            failed: false,
            parked: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.current
            .as_ref()
            .map(|neg| neg.state)
            .unwrap_or(self.resting)
    }

    pub fn partner_id(&self) -> Option<&str> {
        self.current.as_ref().map(|neg| neg.partner_id.as_str())
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn set_local_id(&mut self, local_id: Option<String>) {
        self.local_id = local_id;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while a preparation is outstanding
    pub fn is_negotiating(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|neg| neg.preparing.is_some())
    }

    pub fn has_peer_connection(&self) -> bool {
        self.current.as_ref().is_some_and(|neg| neg.pc.is_some())
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Remote candidates waiting for a remote description
    pub fn buffered_remote_candidates(&self) -> usize {
        self.current
            .as_ref()
            .map(|neg| neg.remote_candidates.len())
            .unwrap_or(0)
    }

    /// Begins a call to `partner_id` as the offering side.
    ///
    /// Returns `None` when a negotiation with this partner is already
    /// under way. A negotiation with a different partner is torn down first.
    pub async fn start_call(&mut self, partner_id: &str) -> Option<Preparation> {
        if let Some(neg) = &self.current {
            if neg.partner_id == partner_id {
                debug!(
                    "Negotiation with {} already in progress ({}), start ignored",
                    partner_id, neg.state
                );
                return None;
            }
            info!(
                "Starting call to {} replaces negotiation with {}",
                partner_id, neg.partner_id
            );
            self.teardown().await;
        }

        self.failed = false;
        Some(self.begin(partner_id.to_string(), Intent::Offer))
    }

    fn begin(&mut self, partner_id: String, intent: Intent) -> Preparation {
        self.generation += 1;
        let generation = self.generation;
        let mut neg = Negotiation::new(generation, partner_id.clone(), intent);

        let parked = std::mem::take(&mut self.parked);
        let (adopted, rest): (Vec<_>, Vec<_>) = parked
            .into_iter()
            .partition(|(sender, _)| *sender == partner_id);
        self.parked = rest;
        if !adopted.is_empty() {
            debug!(
                "Adopting {} early candidate(s) from {}",
                adopted.len(),
                partner_id
            );
            neg.remote_candidates
                .extend(adopted.into_iter().map(|(_, candidate)| candidate));
        }

        info!(
            "Preparing peer connection for {} (generation {})",
            partner_id, generation
        );
        self.current = Some(neg);
        self.prepare(partner_id, generation)
    }

    fn prepare(&self, partner_id: String, generation: u64) -> Preparation {
        let deps = self.deps.clone();
        let policy = self.config.relay_policy;
        let fallback = self.config.fallback_relays.clone();
        let timeout = self.config.relay_timeout;
        let events = self.events.clone();

        async move {
            let outcome = build_peer(
                &deps,
                policy,
                &fallback,
                timeout,
                &partner_id,
                generation,
                events,
            )
            .await;
            Prepared {
                generation,
                partner_id,
                outcome,
            }
        }
        .boxed()
    }

    /// Installs the result of a preparation and carries out its intent.
    ///
    /// Results from a superseded negotiation are closed and dropped.
    pub async fn on_prepared(&mut self, prepared: Prepared) -> Result<()> {
        let Prepared {
            generation,
            partner_id,
            outcome,
        } = prepared;

        let current = self
            .current
            .as_mut()
            .filter(|neg| neg.generation == generation && neg.preparing.is_some());
        let Some(neg) = current else {
            debug!(
                "Discarding stale preparation for {} (generation {})",
                partner_id, generation
            );
            if let Ok(peer) = outcome {
                self.dispose(peer).await;
            }
            return Ok(());
        };

        let peer = match outcome {
            Ok(peer) => peer,
            Err(e) => {
                neg.preparing = None;
                let surfaced = match e {
                    Error::MediaAccess(_) | Error::NegotiationFailure(_) => e,
                    Error::CreatePeerConnectionFailed(msg) => Error::NegotiationFailure(format!(
                        "could not create peer connection: {}",
                        msg
                    )),
                    other => Error::NegotiationFailure(other.to_string()),
                };
                return self.fail(surfaced).await;
            }
        };

        let intent = neg.preparing.take();
        neg.pc = Some(peer.pc);
        neg.media = Some(peer.media);
        neg.state = NegotiationState::AwaitingLocalOffer;

        match intent {
            Some(Intent::Answer(offer)) => self.accept_offer(offer).await,
            _ => self.send_offer().await,
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        let Some((pc, partner_id)) = self.active_pc() else {
            return Ok(());
        };

        let offer = match create_and_apply_offer(pc.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => return self.fail(e).await,
        };

        self.send_signal(
            OFFER,
            &OfferPayload {
                sdp: offer,
                sender: self.local_id.clone(),
                target: Some(partner_id.clone()),
            },
        );
        if let Some(neg) = self.current.as_mut() {
            neg.state = NegotiationState::OfferSent;
        }
        info!("Offer sent to {}", partner_id);
        Ok(())
    }

    /// Applies a remote offer and answers it. The connection must exist.
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<()> {
        let Some((pc, partner_id)) = self.active_pc() else {
            return Ok(());
        };

        if let Err(e) = pc.set_remote_description(offer).await {
            return self.fail(e).await;
        }
        self.remote_applied().await;

        let answer = match create_and_apply_answer(pc.as_ref()).await {
            Ok(answer) => answer,
            Err(e) => return self.fail(e).await,
        };

        self.send_signal(
            ANSWER,
            &AnswerPayload {
                sdp: answer,
                sender: self.local_id.clone(),
                target: Some(partner_id.clone()),
            },
        );
        if let Some(neg) = self.current.as_mut() {
            neg.state = NegotiationState::Stable;
        }
        self.flush_local_candidates();
        info!("Answer sent to {}, negotiation stable", partner_id);
        Ok(())
    }

    /// Handles an inbound `offer`. May start a preparation with answer intent.
    pub async fn on_offer(&mut self, payload: OfferPayload) -> Result<Option<Preparation>> {
        let sender = match (&payload.sender, &self.current) {
            (Some(sender), _) => sender.clone(),
            (None, Some(neg)) => neg.partner_id.clone(),
            (None, None) => {
                warn!("Protocol violation: offer without sender and no partner, discarded");
                return Ok(None);
            }
        };

        let Some(neg) = self.current.as_mut() else {
            if self.failed {
                info!(
                    "Ignoring offer from {} after a failed negotiation; waiting for next",
                    sender
                );
                return Ok(None);
            }
            info!("Offer from {} with no connection, answering", sender);
            return Ok(Some(self.begin(sender, Intent::Answer(payload.sdp))));
        };

        if neg.partner_id != sender {
            warn!(
                "Protocol violation: offer from {} while negotiating with {}, discarded",
                sender, neg.partner_id
            );
            return Ok(None);
        }

        if let Some(intent) = neg.preparing.as_mut() {
            match intent {
                Intent::Offer => match resolve_glare(self.local_id.as_deref(), &sender) {
                    GlareOutcome::Yield => {
                        info!("Glare with {} while preparing: switching to answer", sender);
                        *intent = Intent::Answer(payload.sdp);
                    }
                    GlareOutcome::Ignore => {
                        info!("Glare with {} while preparing: keeping our offer", sender);
                    }
                },
                Intent::Answer(_) => {
                    debug!("Newer offer from {} replaces the pending one", sender);
                    *intent = Intent::Answer(payload.sdp);
                }
            }
            return Ok(None);
        }

        let state = neg.state;
        if state.is_awaiting_answer() {
            match resolve_glare(self.local_id.as_deref(), &sender) {
                GlareOutcome::Ignore => {
                    info!("Glare with {}: keeping our offer, remote offer ignored", sender);
                    Ok(None)
                }
                GlareOutcome::Yield => {
                    info!("Glare with {}: rolling back our offer", sender);
                    let rollback = match self.active_pc() {
                        Some((pc, _)) => pc.rollback_local_offer().await,
                        None => Ok(()),
                    };
                    if let Err(e) = rollback {
                        return self.fail(e).await.map(|_| None);
                    }
                    if let Some(neg) = self.current.as_mut() {
                        neg.state = NegotiationState::Idle;
                    }
                    self.accept_offer(payload.sdp).await.map(|_| None)
                }
            }
        } else if state.accepts_remote_offer() {
            debug!("Renegotiation offer from {} in {}", sender, state);
            self.accept_offer(payload.sdp).await.map(|_| None)
        } else {
            warn!(
                "Protocol violation: offer from {} in state {}, discarded",
                sender, state
            );
            Ok(None)
        }
    }

    /// Handles an inbound `answer`. Only valid while our offer is outstanding.
    pub async fn on_answer(&mut self, payload: AnswerPayload) -> Result<()> {
        let Some(neg) = self.current.as_mut() else {
            warn!(
                "Protocol violation: answer in state {}, discarded",
                self.resting
            );
            return Ok(());
        };

        if let Some(sender) = &payload.sender {
            if *sender != neg.partner_id {
                warn!(
                    "Protocol violation: answer from {} while negotiating with {}, discarded",
                    sender, neg.partner_id
                );
                return Ok(());
            }
        }
        if !neg.state.is_awaiting_answer() {
            warn!(
                "Protocol violation: answer in state {}, discarded",
                neg.state
            );
            return Ok(());
        }

        let Some((pc, partner_id)) = self.active_pc() else {
            return Ok(());
        };
        if let Err(e) = pc.set_remote_description(payload.sdp).await {
            return self.fail(e).await;
        }
        if let Some(neg) = self.current.as_mut() {
            neg.state = NegotiationState::AnswerReceived;
        }
        self.remote_applied().await;
        self.flush_local_candidates();
        if let Some(neg) = self.current.as_mut() {
            neg.state = NegotiationState::Stable;
        }
        info!("Answer from {} applied, negotiation stable", partner_id);
        Ok(())
    }

    /// Handles an inbound `ice-candidate`
    pub async fn on_remote_candidate(&mut self, payload: CandidatePayload) {
        let CandidatePayload {
            candidate, sender, ..
        } = payload;

        let Some(neg) = self.current.as_mut() else {
            // Without a sender a candidate may belong to a partner already gone
            let Some(sender) = sender else {
                debug!("Dropping unattributed candidate with no negotiation");
                return;
            };
            if self.parked.len() >= MAX_PARKED_CANDIDATES {
                warn!("Early candidate buffer full, candidate dropped");
                return;
            }
            debug!("Parking early candidate from {}", sender);
            self.parked.push((sender, candidate));
            return;
        };

        if let Some(sender) = &sender {
            if *sender != neg.partner_id {
                warn!(
                    "Protocol violation: candidate from {} while negotiating with {}, discarded",
                    sender, neg.partner_id
                );
                return;
            }
        }

        match (&neg.pc, neg.remote_applied) {
            (Some(pc), true) => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!("Failed to add remote candidate: {}", e);
                }
            }
            _ => {
                neg.remote_candidates.push(candidate);
                debug!(
                    "Buffered remote candidate ({} pending)",
                    neg.remote_candidates.len()
                );
            }
        }
    }

    /// Handles a callback from the current peer connection
    pub async fn on_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        let Some(neg) = self
            .current
            .as_mut()
            .filter(|neg| neg.generation == event.generation())
        else {
            debug!("Dropping stale peer event {:?}", event);
            return Ok(());
        };
        let partner_id = neg.partner_id.clone();

        match event {
            PeerEvent::LocalCandidate { candidate, .. } => {
                neg.gathered.push(candidate.clone());
                if neg.remote_applied {
                    self.send_candidate(candidate);
                } else {
                    neg.local_candidates.push(candidate);
                }
            }
            PeerEvent::GatheringComplete { .. } => {
                analyze_candidates(&neg.gathered);
            }
            PeerEvent::RemoteTrack {
                track_id, kind, ..
            } => {
                info!("Remote {} track {} from {}", kind, track_id, partner_id);
                self.notifier.emit(UiEvent::RemoteStreamAvailable {
                    partner_id,
                    track_id,
                    kind,
                });
            }
            PeerEvent::StateChanged { state, generation } => match state {
                PeerConnectionState::Connected => {
                    let recovered = neg.cancel_grace_timer();
                    let first = !neg.connected_once;
                    neg.connected_once = true;
                    if recovered {
                        info!("Connection to {} recovered", partner_id);
                        self.notifier
                            .emit(UiEvent::ConnectionRecovered { partner_id });
                    } else if first {
                        info!("Connected to {}", partner_id);
                        self.notifier.emit(UiEvent::CallConnected { partner_id });
                    }
                }
                PeerConnectionState::Disconnected => {
                    if neg.grace_timer.is_none() {
                        warn!(
                            "Connection to {} interrupted, waiting {:?} for recovery",
                            partner_id, self.config.grace_period
                        );
                        let events = self.events.clone();
                        let grace = self.config.grace_period;
                        neg.grace_timer = Some(tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = events.send(PeerEvent::GraceExpired { generation });
                        }));
                        self.notifier.emit(UiEvent::ConnectionProblem { partner_id });
                    }
                }
                PeerConnectionState::Failed => {
                    return self
                        .fail(Error::NegotiationFailure(format!(
                            "ICE connection to {} failed",
                            partner_id
                        )))
                        .await;
                }
                other => debug!("Peer connection to {} is {:?}", partner_id, other),
            },
            PeerEvent::GraceExpired { .. } => {
                if neg.grace_timer.take().is_some() {
                    return self
                        .fail(Error::NegotiationFailure(format!(
                            "connection to {} not recovered within {:?}",
                            partner_id, self.config.grace_period
                        )))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Closes the connection, releases media and forgets the partner.
    ///
    /// Returns the partner that was active, if any. Any outstanding
    /// preparation becomes stale.
    pub async fn teardown(&mut self) -> Option<String> {
        self.failed = false;
        let partner = self.release_current().await;
        self.resting = NegotiationState::Closed;
        partner
    }

    async fn release_current(&mut self) -> Option<String> {
        if !self.parked.is_empty() {
            debug!("Dropping {} parked candidate(s)", self.parked.len());
            self.parked.clear();
        }
        let mut neg = self.current.take()?;
        neg.cancel_grace_timer();
        self.resting = NegotiationState::Closed;

        if let Some(pc) = neg.pc.take() {
            if let Err(e) = pc.close().await {
                warn!("Error closing connection to {}: {}", neg.partner_id, e);
            }
        }
        if let Some(media) = neg.media.take() {
            self.deps.media.release(media).await;
        }
        if !neg.remote_candidates.is_empty() {
            debug!(
                "Dropping {} unapplied remote candidate(s)",
                neg.remote_candidates.len()
            );
        }

        info!(
            "Negotiation with {} closed (generation {})",
            neg.partner_id, neg.generation
        );
        Some(neg.partner_id)
    }

    /// Common failure path: teardown, surface, no retry
    async fn fail(&mut self, err: Error) -> Result<()> {
        error!("Negotiation failed: {}", err);
        self.release_current().await;
        self.failed = true;
        self.notifier.failure(&err);
        Err(err)
    }

    async fn dispose(&self, peer: PreparedPeer) {
        if let Err(e) = peer.pc.close().await {
            warn!("Error closing stale connection: {}", e);
        }
        self.deps.media.release(peer.media).await;
    }

    fn active_pc(&self) -> Option<(Arc<dyn PeerConnection>, String)> {
        let neg = self.current.as_ref()?;
        Some((neg.pc.clone()?, neg.partner_id.clone()))
    }

    /// Marks the remote description applied and flushes buffered remote
    /// candidates in arrival order
    async fn remote_applied(&mut self) {
        let Some(neg) = self.current.as_mut() else {
            return;
        };
        neg.remote_applied = true;
        let pending = neg.remote_candidates.drain();
        let Some(pc) = neg.pc.clone() else {
            return;
        };
        if !pending.is_empty() {
            debug!("Applying {} buffered remote candidate(s)", pending.len());
        }
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Failed to add buffered candidate: {}", e);
            }
        }
    }

    fn flush_local_candidates(&mut self) {
        let pending = match self.current.as_mut() {
            Some(neg) => neg.local_candidates.drain(),
            None => return,
        };
        for candidate in pending {
            self.send_candidate(candidate);
        }
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        let Some(neg) = self.current.as_ref() else {
            return;
        };
        self.send_signal(
            ICE_CANDIDATE,
            &CandidatePayload {
                candidate,
                sender: self.local_id.clone(),
                target: Some(neg.partner_id.clone()),
            },
        );
    }

    fn send_signal<T: Serialize>(&self, event: &str, payload: &T) {
        if let Err(e) = emit(self.deps.signaler.as_ref(), event, payload) {
            warn!("Failed to send '{}': {}", event, e);
        }
    }
}

/// Builds and equips a connection, cleaning up partial resources on error
async fn build_peer(
    deps: &EngineDeps,
    policy: RelayPolicy,
    fallback: &[RelayDescriptor],
    timeout: Duration,
    partner_id: &str,
    generation: u64,
    events: PeerEventSender,
) -> Result<PreparedPeer> {
    let relays = select_relays(deps.relays.as_ref(), policy, fallback, timeout).await?;
    let media = deps.media.acquire().await?;

    let setup = PeerSetup {
        partner_id: partner_id.to_string(),
        generation,
        relays,
        events,
    };
    let pc = match deps.peers.create(setup).await {
        Ok(pc) => pc,
        Err(e) => {
            deps.media.release(media).await;
            return Err(e);
        }
    };

    if let Err(e) = pc.add_local_media(&media).await {
        if let Err(close_err) = pc.close().await {
            warn!("Failed to close partial connection: {}", close_err);
        }
        deps.media.release(media).await;
        return Err(e);
    }

    Ok(PreparedPeer { pc, media })
}

async fn create_and_apply_offer(pc: &dyn PeerConnection) -> Result<SessionDescription> {
    let offer = pc.create_offer().await?;
    pc.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn create_and_apply_answer(pc: &dyn PeerConnection) -> Result<SessionDescription> {
    let answer = pc.create_answer().await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(answer)
}
