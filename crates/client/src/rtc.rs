//! webrtc-rs backed [`PeerConnection`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use duet_protocol::{IceCandidateInit, IceServerInfo, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::TrackLocal;

use crate::media::LocalMedia;
use crate::peer::{
    CandidateType, IceConnectionState, InboundStreamStats, MediaKind, PeerConnection,
    PeerConnectionState, PeerEvent, PeerFactory, PeerParts, RemoteTrack, SelectedPair,
    SignalingState, StatsSnapshot,
};

pub fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

pub fn connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

pub fn ice_connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn to_rtc_description(desc: SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => anyhow::bail!("rollback descriptions are not supported"),
    };
    parsed.context("Failed to parse SDP")
}

fn from_rtc_description(desc: RTCSessionDescription) -> anyhow::Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => anyhow::bail!("description without SDP type"),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn rtc_ice_servers(servers: &[IceServerInfo]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Reduce a webrtc-rs stats report to the fields the call core reads.
fn snapshot_from(report: &StatsReport) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot::default();
    let mut candidates: HashMap<&str, Option<CandidateType>> = HashMap::new();
    let mut nominated = None;

    for stat in report.reports.values() {
        match stat {
            StatsReportType::InboundRTP(rtp) => {
                let stream = InboundStreamStats {
                    packets_received: rtp.packets_received,
                    bytes_received: rtp.bytes_received,
                    ..Default::default()
                };
                match rtp.kind.as_str() {
                    "video" => snapshot.inbound_video = Some(stream),
                    "audio" => snapshot.inbound_audio = Some(stream),
                    _ => {}
                }
            }
            StatsReportType::OutboundRTP(rtp) => {
                *snapshot.bytes_sent.get_or_insert(0) += rtp.bytes_sent;
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                if let Some(rtt) = remote.round_trip_time {
                    snapshot.remote_round_trip_time = Some(rtt);
                }
            }
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                nominated = Some(pair);
            }
            StatsReportType::LocalCandidate(c) | StatsReportType::RemoteCandidate(c) => {
                candidates.insert(
                    c.id.as_str(),
                    CandidateType::parse(&c.candidate_type.to_string()),
                );
            }
            _ => {}
        }
    }

    if let Some(pair) = nominated {
        let lookup = |id: &str| candidates.get(id).copied().flatten();
        snapshot.selected_pair = Some(SelectedPair {
            local: lookup(&pair.local_candidate_id),
            remote: lookup(&pair.remote_candidate_id),
            current_round_trip_time: (pair.current_round_trip_time > 0.0)
                .then_some(pair.current_round_trip_time),
        });
    }
    snapshot
}

/// Builds one webrtc-rs connection per call attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, ice_servers: &[IceServerInfo]) -> anyhow::Result<PeerParts> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let (tx, events) = mpsc::unbounded_channel();
        wire_callbacks(&pc, tx);
        info!(servers = ice_servers.len(), "WebRTC peer connection created");

        Ok(PeerParts {
            peer: Arc::new(RtcPeer { pc }),
            events,
        })
    }
}

fn wire_callbacks(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<PeerEvent>) {
    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        match state {
            RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
            RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
            _ => info!(?state, "Peer connection state changed"),
        }
        let _ = state_tx.send(PeerEvent::ConnectionState(connection_state(state)));
        Box::pin(async {})
    }));

    let ice_tx = tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        debug!(?state, "ICE connection state changed");
        let _ = ice_tx.send(PeerEvent::IceConnectionState(ice_connection_state(state)));
        Box::pin(async {})
    }));

    let candidate_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(json) => {
                    let _ = candidate_tx.send(PeerEvent::IceCandidate(IceCandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
            }
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                track: Some(track),
            }));
        }
        Box::pin(async {})
    }));
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        connection_state(self.pc.connection_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        ice_connection_state(self.pc.ice_connection_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self, ice_restart: bool) -> anyhow::Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .context("Failed to create offer")?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        for line in desc.sdp.lines() {
            if line.starts_with("m=") || line.starts_with("a=rtpmap:") {
                debug!(sdp_line = line, "Remote SDP");
            }
        }
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    async fn add_local_media(&self, media: &LocalMedia) -> anyhow::Result<()> {
        for track in &media.tracks {
            let sender = self
                .pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .with_context(|| format!("Failed to add track {}", track.id()))?;
            // Interceptors only run while RTCP is being read.
            tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
        }
        Ok(())
    }

    async fn stats(&self) -> StatsSnapshot {
        snapshot_from(&self.pc.get_stats().await)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_states_map_onto_core_vocabulary() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
        assert_eq!(
            ice_connection_state(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
        assert_eq!(
            signaling_state(RTCSignalingState::HaveLocalOffer),
            SignalingState::HaveLocalOffer
        );
    }

    #[test]
    fn rollback_is_rejected() {
        let desc = SessionDescription {
            kind: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(desc).is_err());
    }

    #[tokio::test]
    async fn offer_carries_local_tracks() {
        use crate::media::{MediaConstraints, MediaProvider, SyntheticMediaProvider};

        let parts = RtcPeerFactory.create(&[]).await.unwrap();
        let media = SyntheticMediaProvider
            .get_media(&MediaConstraints {
                audio: true,
                video: true,
                audio_device: None,
                video_device: None,
            })
            .await
            .unwrap();
        parts.peer.add_local_media(&media).await.unwrap();

        let offer = parts.peer.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.ice_ufrag().is_some());
        assert_eq!(offer.sdp.matches("m=").count(), 2);
        assert_eq!(parts.peer.signaling_state(), SignalingState::Stable);
        parts.peer.close().await.unwrap();
    }
}
