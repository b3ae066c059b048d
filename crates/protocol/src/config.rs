use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::IceServerInfo;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuetConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL (`ws://` or `wss://`)
    #[serde(default)]
    pub url: String,
    /// PEM certificate to pin for the relay connection
    pub tls_cert: Option<String>,
    /// First delay before reconnecting the WebSocket
    #[serde(default = "default_ws_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Upper bound for the WebSocket reconnect delay
    #[serde(default = "default_ws_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Largest accepted WebSocket message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// ICE/TURN server configuration for NAT traversal.
///
/// Without TURN, calls fail behind symmetric NATs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// HTTP endpoint returning a JSON list of ICE servers. Overrides the
    /// static lists when set.
    pub provider_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Minimum spacing between two first-attempt offers
    #[serde(default = "default_offer_window_ms")]
    pub offer_window_ms: u64,
    /// Attempts per offer/answer before the failure is surfaced
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// A connection not established within this window is failed
    #[serde(default = "default_establishment_timeout_ms")]
    pub establishment_timeout_ms: u64,
    /// How long `disconnected` may persist before reconnecting
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Automatic rebuilds per session
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Wait for the network to settle before restarting ICE
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Minimum spacing between two ICE restarts
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    /// Local route probe interval used by the binary
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Collection endpoint (metrics are sampled but not sent when absent)
    pub endpoint: Option<String>,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    /// Upper bound on samples held while the endpoint is unreachable
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Inbound video bytes above which a `checking`/`completed` link counts
    /// as good
    #[serde(default = "default_good_video_bytes")]
    pub good_video_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            tls_cert: None,
            reconnect_initial_ms: default_ws_reconnect_initial_ms(),
            reconnect_max_ms: default_ws_reconnect_max_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
            provider_url: None,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            offer_window_ms: default_offer_window_ms(),
            max_send_attempts: default_max_send_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            establishment_timeout_ms: default_establishment_timeout_ms(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            throttle_ms: default_throttle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            sample_interval_ms: default_sample_interval_ms(),
            send_interval_ms: default_send_interval_ms(),
            max_buffered: default_max_buffered(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            good_video_bytes: default_good_video_bytes(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            audio_device: None,
            video_device: None,
        }
    }
}

impl IceConfig {
    /// Static ICE server list built from the STUN and TURN entries.
    pub fn servers(&self) -> Vec<IceServerInfo> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

impl NegotiationConfig {
    pub fn offer_window(&self) -> Duration {
        Duration::from_millis(self.offer_window_ms)
    }
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }
    pub fn establishment_timeout(&self) -> Duration {
        Duration::from_millis(self.establishment_timeout_ms)
    }
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl NetworkConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MetricsConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }
}

impl DuetConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the client should not start)
    /// or "WARNING:" (advisory, the client can start but the config is likely
    /// wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling URL ---
        let url = &self.signaling.url;
        if !url.is_empty() && !url.starts_with("ws://") && !url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: signaling.url '{}' must start with 'ws://' or 'wss://'.",
                url
            ));
        }
        if self.signaling.reconnect_initial_ms == 0 {
            issues.push("ERROR: signaling.reconnect_initial_ms must be >= 1.".to_string());
        }
        if self.signaling.reconnect_initial_ms > self.signaling.reconnect_max_ms {
            issues.push(format!(
                "WARNING: signaling.reconnect_initial_ms ({}) exceeds reconnect_max_ms ({}); \
                 every reconnect will wait the maximum.",
                self.signaling.reconnect_initial_ms, self.signaling.reconnect_max_ms
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        // --- Negotiation ---
        let n = &self.negotiation;
        if n.max_send_attempts == 0 {
            issues.push("ERROR: negotiation.max_send_attempts must be >= 1.".to_string());
        }
        if n.retry_base_ms > n.retry_cap_ms {
            issues.push(format!(
                "ERROR: negotiation.retry_base_ms ({}) must not exceed retry_cap_ms ({}).",
                n.retry_base_ms, n.retry_cap_ms
            ));
        }
        if n.establishment_timeout_ms < 1000 {
            issues.push(format!(
                "ERROR: negotiation.establishment_timeout_ms must be at least 1000, got {}.",
                n.establishment_timeout_ms
            ));
        }

        // --- Reconnect ---
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            issues.push(format!(
                "ERROR: reconnect.base_delay_ms ({}) must not exceed max_delay_ms ({}).",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            ));
        }
        if self.reconnect.max_attempts == 0 {
            issues.push(
                "WARNING: reconnect.max_attempts is 0. Failed calls will never be rebuilt \
                 automatically."
                    .to_string(),
            );
        }

        // --- Network ---
        if self.network.poll_interval_ms == 0 {
            issues.push("ERROR: network.poll_interval_ms must be >= 1.".to_string());
        }

        // --- Metrics ---
        let m = &self.metrics;
        if m.enabled {
            if m.sample_interval_ms == 0 || m.send_interval_ms == 0 {
                issues.push(
                    "ERROR: metrics.sample_interval_ms and metrics.send_interval_ms must be >= 1."
                        .to_string(),
                );
            } else if m.send_interval_ms < m.sample_interval_ms {
                issues.push(format!(
                    "WARNING: metrics.send_interval_ms ({}) is shorter than sample_interval_ms \
                     ({}); most batches will be empty.",
                    m.send_interval_ms, m.sample_interval_ms
                ));
            }
            if m.max_buffered == 0 {
                issues.push("ERROR: metrics.max_buffered must be >= 1.".to_string());
            }
            if let Some(endpoint) = &m.endpoint
                && !endpoint.starts_with("http://")
                && !endpoint.starts_with("https://")
            {
                issues.push(format!(
                    "ERROR: metrics.endpoint '{}' must be an http(s) URL.",
                    endpoint
                ));
            }
        }

        // --- Media ---
        if !self.media.audio && !self.media.video {
            issues.push("ERROR: media.audio and media.video cannot both be disabled.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ws_reconnect_initial_ms() -> u64 {
    2_000
}
fn default_ws_reconnect_max_ms() -> u64 {
    60_000
}
fn default_max_message_size() -> usize {
    65_536
}
fn default_offer_window_ms() -> u64 {
    13_000 // 5 offers/minute relay cap plus margin
}
fn default_max_send_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_cap_ms() -> u64 {
    5_000
}
fn default_establishment_timeout_ms() -> u64 {
    30_000
}
fn default_disconnect_grace_ms() -> u64 {
    5_000
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_debounce_ms() -> u64 {
    2_000
}
fn default_throttle_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    3_000
}
fn default_sample_interval_ms() -> u64 {
    5_000
}
fn default_send_interval_ms() -> u64 {
    10_000
}
fn default_max_buffered() -> usize {
    100
}
fn default_good_video_bytes() -> u64 {
    100_000
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
