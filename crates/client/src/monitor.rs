//! Connection state and quality as exposed to the UI.

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::peer::{IceConnectionState, PeerConnectionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Disconnected => "disconnected",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Medium,
    Poor,
}

pub fn classify_connection(raw: PeerConnectionState) -> CallState {
    match raw {
        PeerConnectionState::New | PeerConnectionState::Connecting => CallState::Connecting,
        PeerConnectionState::Connected => CallState::Connected,
        PeerConnectionState::Disconnected => CallState::Disconnected,
        PeerConnectionState::Failed | PeerConnectionState::Closed => CallState::Failed,
    }
}

/// Inbound byte counters sampled for the quality heuristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundBytes {
    pub video: u64,
    pub audio: u64,
}

/// Quality from the ICE state. While checking or completed, inbound bytes
/// decide: video past `good_video_bytes` is good, any flowing data is
/// medium. `None` before ICE has started.
pub fn classify_quality(
    ice: IceConnectionState,
    inbound: InboundBytes,
    good_video_bytes: u64,
) -> Option<Quality> {
    match ice {
        IceConnectionState::New => None,
        IceConnectionState::Connected => Some(Quality::Good),
        IceConnectionState::Checking | IceConnectionState::Completed => {
            if inbound.video > good_video_bytes {
                Some(Quality::Good)
            } else if inbound.video > 0 || inbound.audio > 0 {
                Some(Quality::Medium)
            } else {
                Some(Quality::Poor)
            }
        }
        IceConnectionState::Disconnected
        | IceConnectionState::Failed
        | IceConnectionState::Closed => Some(Quality::Poor),
    }
}

/// Connection state implied by an ICE downgrade, if any.
pub fn ice_downgrade(ice: IceConnectionState) -> Option<CallState> {
    match ice {
        IceConnectionState::Disconnected => Some(CallState::Disconnected),
        IceConnectionState::Failed => Some(CallState::Failed),
        _ => None,
    }
}

/// Publishes state and quality on watch channels.
pub struct LifecycleMonitor {
    state: watch::Sender<CallState>,
    quality: watch::Sender<Option<Quality>>,
}

impl Default for LifecycleMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(CallState::Disconnected);
        let (quality, _) = watch::channel(None);
        Self { state, quality }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<Option<Quality>> {
        self.quality.subscribe()
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn set_state(&self, next: CallState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = %next, "Call state changed");
        }
    }

    pub fn set_quality(&self, next: Option<Quality>) {
        self.quality.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub fn reset(&self) {
        self.set_state(CallState::Disconnected);
        self.set_quality(None);
    }
}
