//! Local media acquisition.

use std::sync::Arc;

use async_trait::async_trait;
use duet_protocol::MediaConfig;
use tracing::info;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::CallError;
use crate::peer::MediaKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            audio: config.audio,
            video: config.video,
            audio_device: config.audio_device.clone(),
            video_device: config.video_device.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: MediaKind,
}

/// Tracks captured for this call.
#[derive(Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Camera/microphone access.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn devices(&self) -> anyhow::Result<Vec<DeviceInfo>>;
    async fn get_media(&self, constraints: &MediaConstraints) -> anyhow::Result<LocalMedia>;
}

/// The session's local media, acquired at most once and shared by every
/// peer connection built for the session.
pub struct LocalMediaSlot {
    provider: Arc<dyn MediaProvider>,
    constraints: MediaConstraints,
    media: Option<LocalMedia>,
}

impl LocalMediaSlot {
    pub fn new(provider: Arc<dyn MediaProvider>, constraints: MediaConstraints) -> Self {
        Self {
            provider,
            constraints,
            media: None,
        }
    }

    /// Current media, acquiring it first if needed.
    pub async fn ensure(&mut self) -> Result<&LocalMedia, CallError> {
        if self.media.is_none() {
            let media = self
                .provider
                .get_media(&self.constraints)
                .await
                .map_err(|e| CallError::media(&e))?;
            info!(
                stream_id = %media.stream_id,
                tracks = media.tracks.len(),
                "Local media acquired"
            );
            self.media = Some(media);
        }
        self.media.as_ref().ok_or_else(|| CallError::Media {
            message: "media slot empty after acquisition".to_string(),
        })
    }

    pub fn current(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    pub fn release(&mut self) {
        if self.media.take().is_some() {
            info!("Local media released");
        }
    }
}

/// Silent Opus and blank VP8 tracks. Lets the binary negotiate a full
/// audio/video call on machines without capture devices.
pub struct SyntheticMediaProvider;

#[async_trait]
impl MediaProvider for SyntheticMediaProvider {
    async fn devices(&self) -> anyhow::Result<Vec<DeviceInfo>> {
        Ok(vec![
            DeviceInfo {
                id: "synthetic-audio".to_string(),
                label: "Synthetic microphone".to_string(),
                kind: MediaKind::Audio,
            },
            DeviceInfo {
                id: "synthetic-video".to_string(),
                label: "Synthetic camera".to_string(),
                kind: MediaKind::Video,
            },
        ])
    }

    async fn get_media(&self, constraints: &MediaConstraints) -> anyhow::Result<LocalMedia> {
        if !constraints.audio && !constraints.video {
            anyhow::bail!("constraints request neither audio nor video");
        }
        let stream_id = format!("duet-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                stream_id.clone(),
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.clone(),
            )));
        }
        Ok(LocalMedia { stream_id, tracks })
    }
}
