use serde::{Deserialize, Serialize};

/// SDP type carried next to the SDP body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description as exchanged on the wire (`{ type, sdp }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// ICE username fragment of the first media section, if any.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|l| l.trim_end().strip_prefix("a=ice-ufrag:"))
    }
}

/// Browser-shaped ICE candidate init (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Candidate type (`host`, `srflx`, `prflx`, `relay`) parsed from the
    /// `typ` attribute of the candidate line.
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        parts.find(|p| *p == "typ")?;
        parts.next()
    }
}

/// Signaling events exchanged with the relay. Every event except `error`
/// is scoped by the session identifier.
///
/// Wire shape: `{"event":"offer","data":{"sessionId":"...","offer":{...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalingMessage {
    Offer {
        session_id: String,
        offer: SessionDescription,
    },
    Answer {
        session_id: String,
        answer: SessionDescription,
    },
    IceCandidate {
        session_id: String,
        candidate: IceCandidateInit,
    },
    /// Both parties are present. `initiator: Some(false)` asks this side to
    /// wait for the partner's offer.
    RoomReady {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator: Option<bool>,
    },
    /// Announce presence in a session's room.
    JoinRoom { session_id: String },
    /// Leave a session's room on clean stop.
    LeaveRoom { session_id: String },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
}

/// Event names, used as subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Offer,
    Answer,
    IceCandidate,
    RoomReady,
    JoinRoom,
    LeaveRoom,
    Error,
}

impl EventKind {
    /// Events a call client listens to.
    pub const INBOUND: [EventKind; 5] = [
        EventKind::Offer,
        EventKind::Answer,
        EventKind::IceCandidate,
        EventKind::RoomReady,
        EventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Offer => "offer",
            EventKind::Answer => "answer",
            EventKind::IceCandidate => "ice-candidate",
            EventKind::RoomReady => "room-ready",
            EventKind::JoinRoom => "join-room",
            EventKind::LeaveRoom => "leave-room",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            SignalingMessage::Offer { .. } => EventKind::Offer,
            SignalingMessage::Answer { .. } => EventKind::Answer,
            SignalingMessage::IceCandidate { .. } => EventKind::IceCandidate,
            SignalingMessage::RoomReady { .. } => EventKind::RoomReady,
            SignalingMessage::JoinRoom { .. } => EventKind::JoinRoom,
            SignalingMessage::LeaveRoom { .. } => EventKind::LeaveRoom,
            SignalingMessage::Error { .. } => EventKind::Error,
        }
    }

    /// Partition key of the message. `None` for relay errors, which are not
    /// tied to a session.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::RoomReady { session_id, .. }
            | SignalingMessage::JoinRoom { session_id }
            | SignalingMessage::LeaveRoom { session_id } => Some(session_id),
            SignalingMessage::Error { .. } => None,
        }
    }
}

/// ICE server descriptor handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerInfo {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}
