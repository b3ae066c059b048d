//! Abstraction over one negotiable peer connection.
//!
//! The call core never touches webrtc-rs directly; it drives a
//! [`PeerConnection`] obtained from a [`PeerFactory`] and consumes the
//! connection's native events from the paired [`PeerEvent`] stream.

use std::sync::Arc;

use async_trait::async_trait;
use duet_protocol::{IceCandidateInit, IceServerInfo, SessionDescription};
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::media::LocalMedia;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Raw connection state as reported by the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Some(CandidateType::Host),
            "srflx" | "server-reflexive" => Some(CandidateType::ServerReflexive),
            "prflx" | "peer-reflexive" => Some(CandidateType::PeerReflexive),
            "relay" | "relayed" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

/// Cumulative counters of one inbound RTP stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundStreamStats {
    pub packets_received: u64,
    pub packets_lost: Option<i64>,
    /// Seconds
    pub jitter: Option<f64>,
    pub bytes_received: u64,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

/// Winning ICE candidate pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPair {
    pub local: Option<CandidateType>,
    pub remote: Option<CandidateType>,
    /// Seconds
    pub current_round_trip_time: Option<f64>,
}

impl SelectedPair {
    pub fn uses_relay(&self) -> bool {
        self.local == Some(CandidateType::Relay) || self.remote == Some(CandidateType::Relay)
    }
}

/// Statistics extracted from one `getStats()` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub inbound_audio: Option<InboundStreamStats>,
    pub inbound_video: Option<InboundStreamStats>,
    pub bytes_sent: Option<u64>,
    /// Seconds, from remote-inbound reports when no pair RTT is known
    pub remote_round_trip_time: Option<f64>,
    pub selected_pair: Option<SelectedPair>,
}

impl StatsSnapshot {
    pub fn inbound_video_bytes(&self) -> u64 {
        self.inbound_video.as_ref().map_or(0, |s| s.bytes_received)
    }

    pub fn inbound_audio_bytes(&self) -> u64 {
        self.inbound_audio.as_ref().map_or(0, |s| s.bytes_received)
    }

    /// Total inbound payload bytes, `None` if no inbound stream exists.
    pub fn bytes_received(&self) -> Option<u64> {
        match (&self.inbound_audio, &self.inbound_video) {
            (None, None) => None,
            _ => Some(self.inbound_audio_bytes() + self.inbound_video_bytes()),
        }
    }
}

/// A track received from the partner.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Media handle for rendering. Absent for synthetic connections.
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Native events raised by a connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidateInit),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    RemoteTrack(RemoteTrack),
}

/// One underlying negotiable connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> PeerConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;

    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self, ice_restart: bool) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> anyhow::Result<()>;

    /// Attach every track of `media` to the connection.
    async fn add_local_media(&self, media: &LocalMedia) -> anyhow::Result<()>;

    async fn stats(&self) -> StatsSnapshot;

    async fn close(&self) -> anyhow::Result<()>;
}

/// A fresh connection plus its native event stream.
pub struct PeerParts {
    pub peer: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, ice_servers: &[IceServerInfo]) -> anyhow::Result<PeerParts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_type_parsing() {
        assert_eq!(CandidateType::parse("relay"), Some(CandidateType::Relay));
        assert_eq!(CandidateType::parse("SRFLX"), Some(CandidateType::ServerReflexive));
        assert_eq!(CandidateType::parse("Unknown candidate type"), None);
    }

    #[test]
    fn selected_pair_relay_on_either_side() {
        let pair = SelectedPair {
            local: Some(CandidateType::Host),
            remote: Some(CandidateType::Relay),
            current_round_trip_time: None,
        };
        assert!(pair.uses_relay());
        let direct = SelectedPair {
            remote: Some(CandidateType::ServerReflexive),
            ..pair
        };
        assert!(!direct.uses_relay());
    }

    #[test]
    fn bytes_received_sums_streams() {
        let snapshot = StatsSnapshot {
            inbound_audio: Some(InboundStreamStats {
                bytes_received: 10,
                ..Default::default()
            }),
            inbound_video: Some(InboundStreamStats {
                bytes_received: 32,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(snapshot.bytes_received(), Some(42));
        assert_eq!(StatsSnapshot::default().bytes_received(), None);
    }
}
