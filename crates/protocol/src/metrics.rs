use serde::{Deserialize, Serialize};

/// One connection-statistics sample. Absent fields were not observable at
/// sample time and are omitted from the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_packet_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_packet_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_jitter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_jitter: Option<f64>,
    /// Round-trip time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_time: Option<f64>,
    /// Bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_bitrate: Option<u64>,
    /// Bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    /// `"{width}x{height}"` of the inbound video
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_connection_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using_relay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
}

impl MetricRecord {
    /// True when at least one measured field is present. The timestamp and
    /// the ICE state are context, not measurements.
    pub fn is_meaningful(&self) -> bool {
        self.audio_packet_loss.is_some()
            || self.video_packet_loss.is_some()
            || self.audio_jitter.is_some()
            || self.video_jitter.is_some()
            || self.round_trip_time.is_some()
            || self.send_bitrate.is_some()
            || self.receive_bitrate.is_some()
            || self.frame_rate.is_some()
            || self.resolution.is_some()
            || self.using_relay.is_some()
            || self.bytes_sent.is_some()
            || self.bytes_received.is_some()
    }
}

/// Body posted to the metrics collection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBatch {
    pub session_id: String,
    pub user_id: String,
    pub metrics: Vec<MetricRecord>,
}

/// Collection endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAck {
    pub accepted: usize,
    #[serde(default)]
    pub server_timestamp: Option<String>,
}
