use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::LocalMedia;
use crate::peer::types::{IceCandidate, RelayDescriptor, SdpKind, SessionDescription};
use crate::relay::RelaySelection;
use crate::{Error, Result};

/// Transport-level state reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback output of a peer connection, tagged with the negotiation
/// generation it belongs to
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    GatheringComplete {
        generation: u64,
    },
    StateChanged {
        generation: u64,
        state: PeerConnectionState,
    },
    RemoteTrack {
        generation: u64,
        track_id: String,
        kind: String,
    },
    GraceExpired {
        generation: u64,
    },
}

impl PeerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PeerEvent::LocalCandidate { generation, .. }
            | PeerEvent::GatheringComplete { generation }
            | PeerEvent::StateChanged { generation, .. }
            | PeerEvent::RemoteTrack { generation, .. }
            | PeerEvent::GraceExpired { generation } => *generation,
        }
    }
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// The operations the negotiation engine performs on a peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Discard a local offer the remote side has not answered
    async fn rollback_local_offer(&self) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Everything needed to build a connection for one partner
pub struct PeerSetup {
    pub partner_id: String,
    pub generation: u64,
    pub relays: RelaySelection,
    pub events: PeerEventSender,
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, setup: PeerSetup) -> Result<Arc<dyn PeerConnection>>;
}

/// webrtc-rs backed connection
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    partner_id: String,
}

/// Builds [`RtcPeer`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, setup: PeerSetup) -> Result<Arc<dyn PeerConnection>> {
        let peer = RtcPeer::new(setup).await?;
        Ok(Arc::new(peer))
    }
}

impl RtcPeer {
    pub async fn new(setup: PeerSetup) -> Result<Self> {
        let PeerSetup {
            partner_id,
            generation,
            relays,
            events,
        } = setup;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            Error::CreatePeerConnectionFailed(format!("failed to register codecs: {}", e))
        })?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                Error::CreatePeerConnectionFailed(format!(
                    "failed to register interceptors: {}",
                    e
                ))
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = rtc_config(&relays);
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| Error::CreatePeerConnectionFailed(e.to_string()))?,
        );

        info!(
            "Created peer connection for {} (generation {}, {} ice server(s), relay_only={})",
            partner_id,
            generation,
            relays.descriptors.len(),
            relays.relay_only
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c).await;
                        match c.to_json() {
                            Ok(init) => {
                                let _ = tx.send(PeerEvent::LocalCandidate {
                                    generation,
                                    candidate: init.into(),
                                });
                            }
                            Err(e) => warn!("Failed to serialize local candidate: {}", e),
                        }
                    }
                    None => {
                        debug!("ICE candidate gathering completed (null candidate received)");
                        let _ = tx.send(PeerEvent::GatheringComplete { generation });
                    }
                }
            })
        }));

        let tx = events.clone();
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {:?}", st);
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            let state = match st {
                RTCPeerConnectionState::New => Some(PeerConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                let _ = tx.send(PeerEvent::StateChanged { generation, state });
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = tx.send(PeerEvent::RemoteTrack {
                    generation,
                    track_id: track.id(),
                    kind: track.kind().to_string(),
                });
                Box::pin(async {})
            },
        ));

        Ok(Self { pc, partner_id })
    }
}

/// Builds the connection configuration from the selected relays
fn rtc_config(relays: &RelaySelection) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&relays.descriptors.descriptors),
        ice_transport_policy: if relays.relay_only {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        },
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

#[allow(clippy::needless_update)]
pub fn ice_servers(descriptors: &[RelayDescriptor]) -> Vec<RTCIceServer> {
    descriptors
        .iter()
        .map(|desc| RTCIceServer {
            urls: vec![desc.ice_url()],
            username: desc.username.clone().unwrap_or_default(),
            credential: desc.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::WebRtc(format!(
            "unexpected session description type {:?}",
            other
        ))),
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        for track in media.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // Drain RTCP so interceptors (NACK, reports) keep working
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        debug!(
            "Attached {} local track(s) for {}",
            media.track_count(),
            self.partner_id
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationFailure(format!("failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationFailure(format!("failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| {
                Error::NegotiationFailure(format!("failed to set local description: {}", e))
            })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| {
                Error::NegotiationFailure(format!("failed to set remote description: {}", e))
            })
    }

    async fn rollback_local_offer(&self) -> Result<()> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(json!({ "type": "rollback", "sdp": "" }))?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::NegotiationFailure(format!("failed to roll back offer: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for {}", self.partner_id);
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{RelayDescriptorSet, RelayTransport};
    use std::time::Duration;

    fn selection(relay_only: bool) -> RelaySelection {
        RelaySelection {
            descriptors: RelayDescriptorSet::new(
                vec![
                    RelayDescriptor::stun("stun.l.google.com:19302"),
                    RelayDescriptor {
                        address: "relay.example.org:3478".into(),
                        transport: RelayTransport::Tcp,
                        username: Some("u".into()),
                        credential: Some("c".into()),
                    },
                ],
                Duration::from_secs(60),
            ),
            relay_only,
        }
    }

    #[test]
    fn test_ice_servers_from_descriptors() {
        let servers = ice_servers(&selection(false).descriptors.descriptors);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(servers[0].username.is_empty());
        assert_eq!(
            servers[1].urls,
            vec!["turn:relay.example.org:3478?transport=tcp".to_string()]
        );
        assert_eq!(servers[1].credential, "c");
    }

    #[test]
    fn test_rtc_config_policy() {
        assert_eq!(
            rtc_config(&selection(true)).ice_transport_policy,
            RTCIceTransportPolicy::Relay
        );
        assert_eq!(
            rtc_config(&selection(false)).ice_transport_policy,
            RTCIceTransportPolicy::All
        );
    }

    #[test]
    fn test_event_generation() {
        let ev = PeerEvent::GraceExpired { generation: 4 };
        assert_eq!(ev.generation(), 4);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_local_peers() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let empty = || RelaySelection {
            descriptors: RelayDescriptorSet::new(vec![], Duration::from_secs(60)),
            relay_only: false,
        };
        let a = RtcPeer::new(PeerSetup {
            partner_id: "b".into(),
            generation: 1,
            relays: empty(),
            events: tx_a,
        })
        .await
        .unwrap();
        let b = RtcPeer::new(PeerSetup {
            partner_id: "a".into(),
            generation: 1,
            relays: empty(),
            events: tx_b,
        })
        .await
        .unwrap();

        let media = crate::media::LocalMedia::new(
            "s",
            Some(Arc::new(
                webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample::new(
                    webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
                        mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_owned(),
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    "s".to_owned(),
                ),
            )),
            None,
        );
        a.add_local_media(&media).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
