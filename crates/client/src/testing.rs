//! In-memory collaborators for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use duet_protocol::{
    EventKind, IceCandidateInit, IceServerInfo, MetricsAck, MetricsBatch, SdpType,
    SessionDescription, SignalingMessage,
};
use tokio::sync::mpsc;

use crate::error::{NegotiationStep, TransportError};
use crate::ice_servers::IceServerProvider;
use crate::media::{DeviceInfo, LocalMedia, MediaConstraints, MediaProvider};
use crate::metrics::MetricsSink;
use crate::peer::{
    IceConnectionState, PeerConnection, PeerConnectionState, PeerEvent, PeerFactory, PeerParts,
    SignalingState, StatsSnapshot,
};
use crate::transport::{SignalingTransport, Subscribers, Subscription};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Relay stand-in: records what was sent and publishes what tests deliver.
pub struct FakeTransport {
    connected: AtomicBool,
    failures: AtomicU32,
    attempts: AtomicU32,
    sent: Mutex<Vec<SignalingMessage>>,
    subscribers: Subscribers,
}

impl FakeTransport {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            subscribers: Subscribers::new(),
        }
    }

    /// Fail the next `n` sends.
    pub fn fail_sends(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Inject an inbound message.
    pub fn deliver(&self, message: SignalingMessage) -> usize {
        self.subscribers.publish(&message)
    }

    pub fn send_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_of(&self, kind: EventKind) -> Vec<SignalingMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.kind() == kind)
            .collect()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.count(kind)
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::NotConnected);
        }
        lock(&self.sent).push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, events: &[EventKind]) -> Subscription {
        self.subscribers.subscribe(events)
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    ice: IceConnectionState,
    remote: Option<SessionDescription>,
    remote_present: Option<bool>,
    rejected: HashSet<String>,
    applied: Vec<IceCandidateInit>,
    fail_next: Option<NegotiationStep>,
    stats: StatsSnapshot,
    offers: u32,
    answers: u32,
    ice_restarts: u32,
    media_attached: bool,
    closed: bool,
}

/// Scriptable peer connection. SDP operations move the signaling state the
/// way a real connection would.
pub struct FakePeer {
    state: Mutex<PeerState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeer {
    fn with_events(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                connection: PeerConnectionState::New,
                ice: IceConnectionState::New,
                remote: None,
                remote_present: None,
                rejected: HashSet::new(),
                applied: Vec::new(),
                fail_next: None,
                stats: StatsSnapshot::default(),
                offers: 0,
                answers: 0,
                ice_restarts: 0,
                media_attached: false,
                closed: false,
            }),
            events,
        }
    }

    /// A peer whose native events go nowhere.
    pub fn new() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::with_events(tx)
    }

    pub fn parts() -> (Arc<FakePeer>, PeerParts) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self::with_events(tx));
        let parts = PeerParts {
            peer: peer.clone(),
            events: rx,
        };
        (peer, parts)
    }

    /// Override whether a remote description is reported as present.
    pub fn set_remote_description_present(&self, present: bool) {
        lock(&self.state).remote_present = Some(present);
    }

    pub fn reject_candidate(&self, candidate: &str) {
        lock(&self.state).rejected.insert(candidate.to_string());
    }

    /// Make the next call of `step` fail.
    pub fn fail_next(&self, step: NegotiationStep) {
        lock(&self.state).fail_next = Some(step);
    }

    pub fn set_stats(&self, stats: StatsSnapshot) {
        lock(&self.state).stats = stats;
    }

    /// Raise a native event, updating the reported state first.
    pub fn emit(&self, event: PeerEvent) {
        {
            let mut state = lock(&self.state);
            match &event {
                PeerEvent::ConnectionState(s) => state.connection = *s,
                PeerEvent::IceConnectionState(s) => state.ice = *s,
                _ => {}
            }
        }
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidateInit> {
        lock(&self.state).applied.clone()
    }

    pub fn has_remote(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    pub fn offers_created(&self) -> u32 {
        lock(&self.state).offers
    }

    pub fn answers_created(&self) -> u32 {
        lock(&self.state).answers
    }

    pub fn ice_restarts(&self) -> u32 {
        lock(&self.state).ice_restarts
    }

    pub fn media_attached(&self) -> bool {
        lock(&self.state).media_attached
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn check(&self, step: NegotiationStep) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            anyhow::bail!("peer connection is closed");
        }
        if state.fail_next == Some(step) {
            state.fail_next = None;
            anyhow::bail!("injected {step} failure");
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        lock(&self.state).connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        lock(&self.state).ice
    }

    async fn has_remote_description(&self) -> bool {
        let state = lock(&self.state);
        state.remote_present.unwrap_or(state.remote.is_some())
    }

    async fn create_offer(&self, ice_restart: bool) -> anyhow::Result<SessionDescription> {
        self.check(NegotiationStep::CreateOffer)?;
        let mut state = lock(&self.state);
        state.offers += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(SessionDescription::offer(format!(
            "v=0\r\na=ice-ufrag:local{}\r\n",
            state.offers
        )))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.check(NegotiationStep::CreateAnswer)?;
        let mut state = lock(&self.state);
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\na=ice-ufrag:answer{}\r\n",
            state.answers
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.check(NegotiationStep::SetLocalDescription)?;
        let mut state = lock(&self.state);
        state.signaling = match desc.kind {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            SdpType::Pranswer => SignalingState::HaveLocalPranswer,
            SdpType::Answer | SdpType::Rollback => SignalingState::Stable,
        };
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.check(NegotiationStep::SetRemoteDescription)?;
        let mut state = lock(&self.state);
        state.signaling = match desc.kind {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            SdpType::Pranswer => SignalingState::HaveRemotePranswer,
            SdpType::Answer | SdpType::Rollback => SignalingState::Stable,
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.rejected.contains(&candidate.candidate) {
            anyhow::bail!("malformed candidate");
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn add_local_media(&self, _media: &LocalMedia) -> anyhow::Result<()> {
        self.check(NegotiationStep::AttachMedia)?;
        lock(&self.state).media_attached = true;
        Ok(())
    }

    async fn stats(&self) -> StatsSnapshot {
        lock(&self.state).stats.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        {
            let mut state = lock(&self.state);
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.connection = PeerConnectionState::Closed;
        }
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        Ok(())
    }
}

/// Factory handing out [`FakePeer`]s and remembering each one.
#[derive(Default)]
pub struct FakeFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    failing: AtomicBool,
}

impl FakeFactory {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        lock(&self.peers).len()
    }

    /// The `n`th connection created. Panics if there is none.
    pub fn peer(&self, n: usize) -> Arc<FakePeer> {
        lock(&self.peers)[n].clone()
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self, _ice_servers: &[IceServerInfo]) -> anyhow::Result<PeerParts> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("peer connection setup refused");
        }
        let (peer, parts) = FakePeer::parts();
        lock(&self.peers).push(peer);
        Ok(parts)
    }
}

/// Media provider returning track-less streams.
#[derive(Default)]
pub struct FakeMedia {
    calls: AtomicU32,
    failing: AtomicBool,
}

impl FakeMedia {
    pub fn failing() -> Self {
        let media = Self::default();
        media.set_failing(true);
        media
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProvider for FakeMedia {
    async fn devices(&self) -> anyhow::Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }

    async fn get_media(&self, _constraints: &MediaConstraints) -> anyhow::Result<LocalMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("camera permission denied");
        }
        Ok(LocalMedia {
            stream_id: "fake-stream".to_string(),
            tracks: Vec::new(),
        })
    }
}

/// Metrics endpoint that records every accepted batch.
#[derive(Default)]
pub struct FakeSink {
    batches: Mutex<Vec<MetricsBatch>>,
    failing: AtomicBool,
}

impl FakeSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<MetricsBatch> {
        lock(&self.batches).clone()
    }
}

#[async_trait]
impl MetricsSink for FakeSink {
    async fn send(&self, batch: &MetricsBatch) -> anyhow::Result<MetricsAck> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("metrics endpoint returned 503");
        }
        lock(&self.batches).push(batch.clone());
        Ok(MetricsAck {
            accepted: batch.metrics.len(),
            server_timestamp: None,
        })
    }
}

pub struct FakeIceServers;

#[async_trait]
impl IceServerProvider for FakeIceServers {
    async fn ice_servers(&self) -> anyhow::Result<Vec<IceServerInfo>> {
        Ok(vec![IceServerInfo::stun("stun:stun.example.test:3478")])
    }
}
