//! Connection statistics sampled alongside a call and shipped in batches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use duet_protocol::{MetricRecord, MetricsAck, MetricsBatch, MetricsConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::peer::{InboundStreamStats, PeerConnection, StatsSnapshot};
use crate::token::{TokenProvider, user_id_from_token};

/// Counters of the previous sample, for bitrate deltas.
#[derive(Debug, Clone, Copy)]
pub struct PreviousSample {
    pub at: Instant,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
}

fn loss_ratio(stream: &InboundStreamStats) -> Option<f64> {
    let lost = stream.packets_lost?.max(0) as f64;
    if stream.packets_received == 0 {
        return None;
    }
    Some(lost / (lost + stream.packets_received as f64))
}

fn bitrate(current: Option<u64>, previous: Option<u64>, elapsed: Duration) -> Option<u64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    let delta = current?.checked_sub(previous?)?;
    Some((delta as f64 * 8.0 / secs).round() as u64)
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Reduce one stats snapshot to a metric record.
pub fn build_record(
    snapshot: &StatsSnapshot,
    ice_state: Option<&str>,
    previous: Option<&PreviousSample>,
    now: Instant,
    timestamp: u64,
) -> MetricRecord {
    let audio = snapshot.inbound_audio.as_ref();
    let video = snapshot.inbound_video.as_ref();
    let pair = snapshot.selected_pair.as_ref();
    let bytes_received = snapshot.bytes_received();

    let rtt_secs = pair
        .and_then(|p| p.current_round_trip_time)
        .or(snapshot.remote_round_trip_time);

    let (send_bitrate, receive_bitrate) = match previous {
        Some(prev) => {
            let elapsed = now.saturating_duration_since(prev.at);
            (
                bitrate(snapshot.bytes_sent, prev.bytes_sent, elapsed),
                bitrate(bytes_received, prev.bytes_received, elapsed),
            )
        }
        None => (None, None),
    };

    let resolution = video.and_then(|v| match (v.frame_width, v.frame_height) {
        (Some(w), Some(h)) => Some(format!("{w}x{h}")),
        _ => None,
    });

    MetricRecord {
        timestamp,
        audio_packet_loss: audio.and_then(loss_ratio),
        video_packet_loss: video.and_then(loss_ratio),
        audio_jitter: audio.and_then(|a| a.jitter),
        video_jitter: video.and_then(|v| v.jitter),
        round_trip_time: rtt_secs.map(|s| s * 1000.0),
        send_bitrate,
        receive_bitrate,
        frame_rate: video.and_then(|v| v.frames_per_second),
        resolution,
        ice_connection_state: ice_state.map(str::to_string),
        using_relay: pair.map(|p| p.uses_relay()),
        bytes_sent: snapshot.bytes_sent,
        bytes_received,
    }
}

/// Records awaiting delivery, oldest first. Records leave the buffer only
/// once the endpoint confirmed them; at capacity new samples are dropped.
#[derive(Debug)]
pub struct MetricsBuffer {
    records: VecDeque<MetricRecord>,
    capacity: usize,
}

impl MetricsBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a sample. Empty samples are discarded, and so is a new
    /// sample once undelivered records fill the buffer.
    pub fn push(&mut self, record: MetricRecord) -> bool {
        if !record.is_meaningful() {
            debug!("Discarding empty metrics sample");
            return false;
        }
        if self.records.len() >= self.capacity {
            warn!(
                buffered = self.records.len(),
                "Metrics buffer full, dropping newest sample"
            );
            return false;
        }
        self.records.push_back(record);
        true
    }

    /// Everything buffered, oldest first. The records stay until
    /// [`confirm`](Self::confirm).
    pub fn pending(&self) -> Vec<MetricRecord> {
        self.records.iter().cloned().collect()
    }

    /// Drop the `delivered` oldest records.
    pub fn confirm(&mut self, delivered: usize) {
        let n = delivered.min(self.records.len());
        self.records.drain(..n);
    }
}

/// Collection endpoint.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn send(&self, batch: &MetricsBatch) -> anyhow::Result<MetricsAck>;
}

pub struct HttpMetricsSink {
    client: reqwest::Client,
    url: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpMetricsSink {
    pub fn new(url: impl Into<String>, token: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl MetricsSink for HttpMetricsSink {
    async fn send(&self, batch: &MetricsBatch) -> anyhow::Result<MetricsAck> {
        let token = self
            .token
            .access_token()
            .context("No access token for metrics upload")?;
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(batch)
            .send()
            .await
            .context("Metrics upload failed")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if let Err(e) = self.token.refresh().await {
                warn!("Token refresh after metrics 401 failed: {e:#}");
            }
            anyhow::bail!("Metrics endpoint rejected access token");
        }
        response
            .error_for_status()
            .context("Metrics endpoint returned error")?
            .json::<MetricsAck>()
            .await
            .context("Invalid metrics acknowledgement")
    }
}

/// Dependencies of the per-connection collector.
#[derive(Clone)]
pub struct MetricsContext {
    pub session_id: String,
    pub sink: Arc<dyn MetricsSink>,
    pub token: Arc<dyn TokenProvider>,
    pub sample_interval: Duration,
    pub send_interval: Duration,
    pub max_buffered: usize,
}

impl MetricsContext {
    pub fn new(
        session_id: impl Into<String>,
        sink: Arc<dyn MetricsSink>,
        token: Arc<dyn TokenProvider>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            token,
            sample_interval: config.sample_interval(),
            send_interval: config.send_interval(),
            max_buffered: config.max_buffered,
        }
    }
}

struct Sampler {
    ctx: MetricsContext,
    peer: Arc<dyn PeerConnection>,
    buffer: MetricsBuffer,
    previous: Option<PreviousSample>,
}

impl Sampler {
    async fn sample(&mut self) {
        let snapshot = self.peer.stats().await;
        let now = Instant::now();
        let ice = self.peer.ice_connection_state();
        let record = build_record(
            &snapshot,
            Some(ice.as_str()),
            self.previous.as_ref(),
            now,
            unix_millis(),
        );
        self.previous = Some(PreviousSample {
            at: now,
            bytes_sent: snapshot.bytes_sent,
            bytes_received: snapshot.bytes_received(),
        });
        self.buffer.push(record);
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(user_id) = self
            .ctx
            .token
            .access_token()
            .and_then(|t| user_id_from_token(&t))
        else {
            debug!("No authenticated user, keeping metrics buffered");
            return;
        };

        let batch = MetricsBatch {
            session_id: self.ctx.session_id.clone(),
            user_id,
            metrics: self.buffer.pending(),
        };
        match self.ctx.sink.send(&batch).await {
            Ok(ack) => {
                debug!(
                    sent = batch.metrics.len(),
                    accepted = ack.accepted,
                    "Metrics batch delivered"
                );
                self.buffer.confirm(batch.metrics.len());
            }
            Err(e) => {
                warn!(
                    buffered = self.buffer.len(),
                    "Failed to deliver metrics batch, keeping it for the next cycle: {e:#}"
                );
            }
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut sample_tick = tokio::time::interval(self.ctx.sample_interval);
        let mut send_tick = tokio::time::interval(self.ctx.send_interval);
        // First ticks complete immediately.
        sample_tick.tick().await;
        send_tick.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = sample_tick.tick() => self.sample().await,
                _ = send_tick.tick() => self.flush().await,
            }
        }
        self.flush().await;
        debug!(session_id = %self.ctx.session_id, "Metrics collector stopped");
    }
}

/// Sampling and sending timers of one peer handle. Dropping the collector
/// without [`stop`](Self::stop) aborts it without a final flush.
pub struct MetricsCollector {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MetricsCollector {
    pub fn start(ctx: MetricsContext, peer: Arc<dyn PeerConnection>) -> Self {
        info!(
            session_id = %ctx.session_id,
            sample_ms = ctx.sample_interval.as_millis() as u64,
            send_ms = ctx.send_interval.as_millis() as u64,
            "Metrics collection started"
        );
        let sampler = Sampler {
            buffer: MetricsBuffer::new(ctx.max_buffered),
            ctx,
            peer,
            previous: None,
        };
        let (stop, stop_rx) = oneshot::channel();
        Self {
            stop: Some(stop),
            task: Some(tokio::spawn(sampler.run(stop_rx))),
        }
    }

    /// Stop both timers. One final flush runs before the returned task ends.
    pub fn stop(mut self) -> Option<JoinHandle<()>> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.take()
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{CandidateType, SelectedPair};
    use crate::testing::{FakePeer, FakeSink};
    use crate::token::StaticToken;

    fn snapshot(bytes_sent: u64, video_bytes: u64) -> StatsSnapshot {
        StatsSnapshot {
            inbound_audio: Some(InboundStreamStats {
                packets_received: 90,
                packets_lost: Some(10),
                jitter: Some(0.004),
                bytes_received: 1_000,
                ..Default::default()
            }),
            inbound_video: Some(InboundStreamStats {
                packets_received: 0,
                packets_lost: Some(0),
                bytes_received: video_bytes,
                frames_per_second: Some(30.0),
                frame_width: Some(640),
                frame_height: Some(480),
                ..Default::default()
            }),
            bytes_sent: Some(bytes_sent),
            remote_round_trip_time: None,
            selected_pair: Some(SelectedPair {
                local: Some(CandidateType::Host),
                remote: Some(CandidateType::Relay),
                current_round_trip_time: Some(0.045),
            }),
        }
    }

    fn record(n: u64) -> MetricRecord {
        MetricRecord {
            timestamp: n,
            bytes_sent: Some(n),
            ..Default::default()
        }
    }

    fn signed_token(sub: &str) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({ "sub": sub }),
            &jsonwebtoken::EncodingKey::from_secret(b"k"),
        )
        .unwrap()
    }

    #[test]
    fn record_extracts_ratios_and_rates() {
        let t0 = Instant::now();
        let prev = PreviousSample {
            at: t0,
            bytes_sent: Some(0),
            bytes_received: Some(1_000),
        };
        let rec = build_record(
            &snapshot(10_000, 5_000),
            Some("connected"),
            Some(&prev),
            t0 + Duration::from_secs(5),
            42,
        );

        assert_eq!(rec.timestamp, 42);
        assert_eq!(rec.audio_packet_loss, Some(0.1));
        // No video packets received: ratio undefined.
        assert_eq!(rec.video_packet_loss, None);
        assert_eq!(rec.round_trip_time, Some(45.0));
        assert_eq!(rec.send_bitrate, Some(16_000));
        assert_eq!(rec.receive_bitrate, Some(8_000));
        assert_eq!(rec.resolution.as_deref(), Some("640x480"));
        assert_eq!(rec.using_relay, Some(true));
        assert_eq!(rec.bytes_received, Some(6_000));
        assert_eq!(rec.ice_connection_state.as_deref(), Some("connected"));
    }

    #[test]
    fn first_sample_has_no_bitrate() {
        let rec = build_record(&snapshot(1, 1), None, None, Instant::now(), 0);
        assert_eq!(rec.send_bitrate, None);
        assert_eq!(rec.receive_bitrate, None);
    }

    #[test]
    fn empty_sample_is_discarded() {
        let mut buffer = MetricsBuffer::new(100);
        let empty = build_record(
            &StatsSnapshot::default(),
            Some("checking"),
            None,
            Instant::now(),
            7,
        );
        assert!(!buffer.push(empty));
        assert_eq!(buffer.len(), 0);
        assert!(buffer.push(record(1)));
        assert_eq!(buffer.len(), 1);
    }

    fn timestamps(buffer: &MetricsBuffer) -> Vec<u64> {
        buffer.pending().iter().map(|r| r.timestamp).collect()
    }

    #[test]
    fn full_buffer_keeps_undelivered_and_drops_newest() {
        let mut buffer = MetricsBuffer::new(3);
        for n in 1..=3 {
            assert!(buffer.push(record(n)));
        }
        // A failed delivery confirms nothing.
        let attempted = buffer.pending();
        assert_eq!(attempted.len(), 3);
        assert!(!buffer.push(record(4)));
        assert_eq!(timestamps(&buffer), vec![1, 2, 3]);

        buffer.confirm(2);
        assert!(buffer.push(record(5)));
        assert_eq!(timestamps(&buffer), vec![3, 5]);
    }

    #[test]
    fn confirm_only_drops_delivered_prefix() {
        let mut buffer = MetricsBuffer::new(10);
        buffer.push(record(1));
        buffer.push(record(2));
        let batch = buffer.pending();
        buffer.push(record(3));
        buffer.confirm(batch.len());
        assert_eq!(timestamps(&buffer), vec![3]);
        buffer.confirm(5);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn collector_samples_sends_and_flushes_on_stop() {
        let peer = Arc::new(FakePeer::new());
        peer.set_stats(snapshot(100, 100));
        let sink = Arc::new(FakeSink::default());
        let token = Arc::new(StaticToken::new(Some(signed_token("user-1"))));
        let ctx = MetricsContext::new("s1", sink.clone(), token, &MetricsConfig::default());

        let collector = MetricsCollector::start(ctx, peer.clone());
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].session_id, "s1");
        assert_eq!(batches[0].user_id, "user-1");
        assert_eq!(batches[0].metrics.len(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        collector.stop().unwrap().await.unwrap();
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.batches()[1].metrics.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_is_retried_next_cycle() {
        let peer = Arc::new(FakePeer::new());
        peer.set_stats(snapshot(100, 100));
        let sink = Arc::new(FakeSink::default());
        sink.set_failing(true);
        let token = Arc::new(StaticToken::new(Some(signed_token("user-1"))));
        let ctx = MetricsContext::new("s1", sink.clone(), token, &MetricsConfig::default());

        let collector = MetricsCollector::start(ctx, peer);
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(sink.batches().is_empty());

        sink.set_failing(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics.len(), 4);
        drop(collector);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_beyond_capacity_keeps_oldest_samples() {
        let peer = Arc::new(FakePeer::new());
        peer.set_stats(snapshot(100, 100));
        let sink = Arc::new(FakeSink::default());
        sink.set_failing(true);
        let token = Arc::new(StaticToken::new(Some(signed_token("user-1"))));
        let config = MetricsConfig {
            max_buffered: 3,
            ..Default::default()
        };
        let ctx = MetricsContext::new("s1", sink.clone(), token, &config);

        let collector = MetricsCollector::start(ctx, peer.clone());
        // Samples at 5s, 10s and 15s fill the buffer; 20s is dropped.
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        assert!(sink.batches().is_empty());

        // Distinguish later samples from the buffered ones.
        peer.set_stats(snapshot(999, 100));
        sink.set_failing(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics.len(), 3);
        assert!(batches[0].metrics.iter().all(|r| r.bytes_sent == Some(100)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].metrics.len(), 2);
        assert!(batches[1].metrics.iter().all(|r| r.bytes_sent == Some(999)));
        drop(collector);
    }

    #[tokio::test(start_paused = true)]
    async fn no_token_keeps_samples_buffered() {
        let peer = Arc::new(FakePeer::new());
        peer.set_stats(snapshot(100, 100));
        let sink = Arc::new(FakeSink::default());
        let token = Arc::new(StaticToken::new(None));
        let ctx = MetricsContext::new("s1", sink.clone(), token.clone(), &MetricsConfig::default());

        let collector = MetricsCollector::start(ctx, peer);
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(sink.batches().is_empty());

        token.set(Some(signed_token("late")));
        collector.stop().unwrap().await.unwrap();
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].metrics.len(), 2);
    }
}
