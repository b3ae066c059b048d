//! The call controller.
//!
//! One tokio task owns the session, the current [`PeerHandle`] and every
//! policy component, and processes commands, inbound signaling, native
//! peer events and timer expiries one at a time. Components never look
//! up the current connection themselves; they are handed the handle.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use duet_protocol::{
    DuetConfig, EventKind, IceCandidateInit, IceServerInfo, SessionDescription, SignalingMessage,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, OfferRateLimiter, RetryPolicy, SharedRateLimiter};
use crate::error::{CallError, DispatchError};
use crate::handle::PeerHandle;
use crate::ice_servers::{IceServerProvider, resolve_ice_servers};
use crate::media::{LocalMedia, LocalMediaSlot, MediaConstraints, MediaProvider};
use crate::metrics::{MetricsContext, MetricsSink};
use crate::monitor::{
    CallState, InboundBytes, LifecycleMonitor, Quality, classify_connection, classify_quality,
    ice_downgrade,
};
use crate::network::{NetworkEvent, NetworkResponder};
use crate::peer::{
    IceConnectionState, PeerConnectionState, PeerEvent, PeerFactory, RemoteTrack,
};
use crate::reconnect::{ReconnectPolicy, ReconnectionController};
use crate::token::TokenProvider;
use crate::transport::{SignalingTransport, Subscription};

/// One paired call, as handed over by the matching layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub partner_id: Option<String>,
    pub created_at: SystemTime,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partner_id: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn with_partner(mut self, partner_id: impl Into<String>) -> Self {
        self.partner_id = Some(partner_id.into());
        self
    }
}

#[derive(Debug)]
pub enum Command {
    StartSession(Session),
    /// Local intent to call: acquire media and offer.
    StartCall,
    StopSession,
    Shutdown,
}

/// Output for the UI layer besides the state/quality watches.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Error(CallError),
    LocalMediaReady(LocalMedia),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug)]
pub(crate) enum EngineEvent {
    Command(Command),
    Peer { generation: u64, event: PeerEvent },
    EstablishmentTimeout { generation: u64 },
    DisconnectGraceElapsed { generation: u64 },
    OfferFailed { generation: u64, error: DispatchError },
    AnswerFailed { generation: u64, error: DispatchError },
    ReconnectDue { attempt: u32 },
    IceRestartDue,
}

/// Collaborators the controller drives.
#[derive(Clone)]
pub struct CallDeps {
    pub transport: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaProvider>,
    pub ice_servers: Arc<dyn IceServerProvider>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    pub token: Arc<dyn TokenProvider>,
}

/// Handle to a running call controller.
pub struct CallClient {
    commands: mpsc::UnboundedSender<EngineEvent>,
    network: mpsc::Sender<NetworkEvent>,
    state: watch::Receiver<CallState>,
    quality: watch::Receiver<Option<Quality>>,
    task: JoinHandle<()>,
}

impl CallClient {
    /// Start the controller task. The receiver yields [`CallEvent`]s.
    pub fn spawn(config: DuetConfig, deps: CallDeps) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (network_tx, network_rx) = mpsc::channel(16);

        let monitor = LifecycleMonitor::new();
        let state = monitor.subscribe_state();
        let quality = monitor.subscribe_quality();

        let restart_tx = tx.clone();
        tokio::spawn(
            NetworkResponder::from(&config.network).run(network_rx, move || {
                let _ = restart_tx.send(EngineEvent::IceRestartDue);
            }),
        );

        let engine = Engine {
            reconnect: ReconnectionController::new(ReconnectPolicy::from(&config.reconnect)),
            limiter: Arc::new(Mutex::new(OfferRateLimiter::new(
                config.negotiation.offer_window(),
            ))),
            config,
            deps,
            tx: tx.clone(),
            events: events_tx,
            monitor,
            session: None,
            next_generation: 0,
        };
        let task = tokio::spawn(engine.run(rx));

        (
            Self {
                commands: tx,
                network: network_tx,
                state,
                quality,
                task,
            },
            events_rx,
        )
    }

    fn command(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(EngineEvent::Command(command))
            .map_err(|_| anyhow::anyhow!("call controller has stopped"))
    }

    pub fn start_session(&self, session: Session) -> anyhow::Result<()> {
        self.command(Command::StartSession(session))
    }

    pub fn start_call(&self) -> anyhow::Result<()> {
        self.command(Command::StartCall)
    }

    pub fn stop_session(&self) -> anyhow::Result<()> {
        self.command(Command::StopSession)
    }

    /// Feed OS network transitions here.
    pub fn network_events(&self) -> mpsc::Sender<NetworkEvent> {
        self.network.clone()
    }

    pub fn state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn quality(&self) -> watch::Receiver<Option<Quality>> {
        self.quality.clone()
    }

    /// Stop the session and wait for the controller to exit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.command(Command::Shutdown);
        self.task.await?;
        Ok(())
    }
}

struct ActiveSession {
    session: Session,
    subscription: Subscription,
    media: LocalMediaSlot,
    ice_servers: Vec<IceServerInfo>,
    room_ready: bool,
    initiator: Option<bool>,
    handle: Option<PeerHandle>,
}

struct Engine {
    config: DuetConfig,
    deps: CallDeps,
    tx: mpsc::UnboundedSender<EngineEvent>,
    events: mpsc::UnboundedSender<CallEvent>,
    monitor: LifecycleMonitor,
    reconnect: ReconnectionController,
    limiter: SharedRateLimiter,
    session: Option<ActiveSession>,
    next_generation: u64,
}

async fn announce(transport: &Arc<dyn SignalingTransport>, message: SignalingMessage) {
    let kind = message.kind();
    if let Err(e) = transport.send(message).await {
        warn!(event = %kind, "Failed to announce room presence: {e}");
    }
}

fn report(events: &mpsc::UnboundedSender<CallEvent>, err: CallError) {
    error!(code = err.code(), "{err}");
    let _ = events.send(CallEvent::Error(err));
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(EngineEvent::Command(Command::Shutdown)) | None => {
                        self.stop_session().await;
                        break;
                    }
                    Some(event) => self.on_event(event).await,
                },
                Some(message) = async {
                    match self.session.as_mut() {
                        Some(active) => active.subscription.recv().await,
                        None => std::future::pending().await,
                    }
                } => self.on_signal(message).await,
            }
        }
        info!("Call controller stopped");
    }

    fn current(&mut self) -> Option<&mut PeerHandle> {
        self.session.as_mut().and_then(|a| a.handle.as_mut())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .and_then(|a| a.handle.as_ref())
            .is_some_and(|h| h.generation() == generation)
    }

    async fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Command(command) => match command {
                Command::StartSession(session) => self.start_session(session).await,
                Command::StartCall => self.start_local_media(true).await,
                Command::StopSession | Command::Shutdown => self.stop_session().await,
            },
            EngineEvent::Peer { generation, event } => {
                if self.is_current(generation) {
                    self.on_peer_event(event).await;
                } else {
                    debug!(generation, ?event, "Dropping event from stale peer connection");
                }
            }
            EngineEvent::EstablishmentTimeout { generation } => {
                if self.is_current(generation) {
                    self.on_establishment_timeout().await;
                }
            }
            EngineEvent::DisconnectGraceElapsed { generation } => {
                if self.is_current(generation) {
                    self.on_disconnect_grace_elapsed().await;
                }
            }
            EngineEvent::OfferFailed { generation, error }
            | EngineEvent::AnswerFailed { generation, error } => {
                if self.is_current(generation) {
                    report(&self.events, error.into());
                }
            }
            EngineEvent::ReconnectDue { attempt } => self.on_reconnect_due(attempt).await,
            EngineEvent::IceRestartDue => self.on_ice_restart().await,
        }
    }

    async fn start_session(&mut self, session: Session) {
        if self.session.is_some() {
            self.stop_session().await;
        }
        self.reconnect.reset();

        let subscription = self.deps.transport.subscribe(&EventKind::INBOUND);
        let ice_servers = resolve_ice_servers(self.deps.ice_servers.as_ref()).await;
        let media = LocalMediaSlot::new(
            Arc::clone(&self.deps.media),
            MediaConstraints::from(&self.config.media),
        );
        info!(
            session_id = %session.id,
            partner = ?session.partner_id,
            "Session started"
        );
        announce(
            &self.deps.transport,
            SignalingMessage::JoinRoom {
                session_id: session.id.clone(),
            },
        )
        .await;

        self.session = Some(ActiveSession {
            session,
            subscription,
            media,
            ice_servers,
            room_ready: false,
            initiator: None,
            handle: None,
        });
        self.monitor.reset();
    }

    async fn stop_session(&mut self) {
        self.reconnect.reset();
        let Some(mut active) = self.session.take() else {
            return;
        };
        if let Some(handle) = active.handle.take() {
            handle.close().await;
        }
        active.media.release();
        announce(
            &self.deps.transport,
            SignalingMessage::LeaveRoom {
                session_id: active.session.id.clone(),
            },
        )
        .await;
        info!(session_id = %active.session.id, "Session stopped");
        drop(active);
        self.monitor.reset();
    }

    /// Create the session's peer connection if there is none.
    async fn ensure_handle(&mut self) -> Result<(), CallError> {
        let Some(active) = self.session.as_mut() else {
            return Ok(());
        };
        if active.handle.is_some() {
            return Ok(());
        }

        let parts = self
            .deps
            .peers
            .create(&active.ice_servers)
            .await
            .map_err(|e| CallError::PeerSetup {
                message: format!("{e:#}"),
            })?;
        self.next_generation += 1;
        let generation = self.next_generation;
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.deps.transport),
            active.session.id.clone(),
            RetryPolicy::from(&self.config.negotiation),
            Arc::clone(&self.limiter),
        );
        active.handle = Some(PeerHandle::new(
            generation,
            parts,
            dispatcher,
            self.tx.clone(),
            self.config.negotiation.establishment_timeout(),
        ));
        info!(session_id = %active.session.id, generation, "Peer connection created");
        self.monitor.set_state(CallState::Connecting);
        self.monitor.set_quality(None);
        Ok(())
    }

    /// Acquire local media, attach it and start an offer. Without an
    /// explicit call intent the offer waits for room-ready; a partner
    /// acting as initiator is always left to offer.
    async fn start_local_media(&mut self, explicit: bool) {
        let Some(active) = self.session.as_mut() else {
            warn!("Call start requested without an active session");
            return;
        };
        let fresh = active.media.current().is_none();
        let media = match active.media.ensure().await {
            Ok(media) => media.clone(),
            Err(e) => {
                report(&self.events, e);
                return;
            }
        };
        if fresh {
            let _ = self.events.send(CallEvent::LocalMediaReady(media.clone()));
        }
        let wait_for_partner = active.initiator == Some(false);
        let gated = !explicit && !active.room_ready;

        if let Err(e) = self.ensure_handle().await {
            report(&self.events, e);
            return;
        }
        let Some(handle) = self.current() else {
            return;
        };
        let peer = Arc::clone(handle.peer());
        if let Err(e) = handle.negotiator.attach_local_media(peer.as_ref(), &media).await {
            report(&self.events, e);
            return;
        }
        if wait_for_partner {
            info!("Local media ready, waiting for partner's offer");
            return;
        }
        if gated {
            info!("Local media ready, waiting for room-ready");
            return;
        }
        self.begin_offer(false).await;
    }

    async fn begin_offer(&mut self, ice_restart: bool) {
        let Some(handle) = self.session.as_mut().and_then(|a| a.handle.as_mut()) else {
            return;
        };
        let peer = Arc::clone(handle.peer());
        match handle.negotiator.create_offer(peer.as_ref(), ice_restart).await {
            Ok(Some(offer)) => handle.spawn_offer(offer),
            Ok(None) => {}
            Err(e) => report(&self.events, e),
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        let Some(active) = self.session.as_mut() else {
            return;
        };
        if let SignalingMessage::Error {
            code,
            message,
            event_id,
        } = message
        {
            report(
                &self.events,
                CallError::Server {
                    server_code: code,
                    message,
                    event_id,
                },
            );
            return;
        }
        if message.session_id() != Some(active.session.id.as_str()) {
            debug!(
                event = %message.kind(),
                session_id = ?message.session_id(),
                "Ignoring message for another session"
            );
            return;
        }

        match message {
            SignalingMessage::Offer { offer, .. } => self.on_remote_offer(offer).await,
            SignalingMessage::Answer { answer, .. } => self.on_remote_answer(answer).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
            SignalingMessage::RoomReady { initiator, .. } => {
                info!(?initiator, "Room ready");
                active.room_ready = true;
                active.initiator = initiator;
                self.start_local_media(false).await;
            }
            other => debug!(event = %other.kind(), "Unhandled signaling event"),
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        if let Err(e) = self.ensure_handle().await {
            report(&self.events, e);
            return;
        }
        let Some(active) = self.session.as_mut() else {
            return;
        };
        let Some(handle) = active.handle.as_mut() else {
            return;
        };
        let fresh = active.media.current().is_none();
        let peer = Arc::clone(handle.peer());
        match handle
            .negotiator
            .accept_offer(peer.as_ref(), &mut active.media, offer)
            .await
        {
            Ok(Some(answer)) => handle.spawn_answer(answer),
            Ok(None) => {}
            Err(e) => report(&self.events, e),
        }
        if fresh && let Some(media) = active.media.current() {
            let _ = self.events.send(CallEvent::LocalMediaReady(media.clone()));
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some(handle) = self.session.as_mut().and_then(|a| a.handle.as_mut()) else {
            debug!("Answer received without a peer connection");
            return;
        };
        let peer = Arc::clone(handle.peer());
        match handle.negotiator.accept_answer(peer.as_ref(), answer).await {
            Ok(true) => {
                handle.cancel_offer();
                handle.cancel_establishment();
            }
            Ok(false) => {}
            Err(e) => report(&self.events, e),
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidateInit) {
        if let Err(e) = self.ensure_handle().await {
            report(&self.events, e);
            return;
        }
        let Some(handle) = self.current() else {
            return;
        };
        let peer = Arc::clone(handle.peer());
        handle.negotiator.submit_candidate(peer.as_ref(), candidate).await;
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Some(handle) = self.current() {
                    handle.spawn_candidate(candidate);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                info!(track_id = %track.id, kind = ?track.kind, "Remote track received");
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            PeerEvent::ConnectionState(raw) => self.on_connection_state(raw).await,
            PeerEvent::IceConnectionState(ice) => self.on_ice_state(ice).await,
        }
    }

    async fn on_connection_state(&mut self, raw: PeerConnectionState) {
        self.monitor.set_state(classify_connection(raw));
        let grace = self.config.negotiation.disconnect_grace();
        let metrics = self.metrics_context();
        let Some(handle) = self.current() else {
            return;
        };

        match raw {
            PeerConnectionState::Connected => {
                handle.cancel_establishment();
                handle.cancel_disconnect_grace();
                if let Some(ctx) = metrics {
                    handle.start_metrics(ctx);
                }
                self.reconnect.on_connected();
            }
            PeerConnectionState::Disconnected => {
                warn!(generation = handle.generation(), "Peer connection disconnected");
                handle.arm_disconnect_grace(grace);
            }
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                warn!(generation = handle.generation(), ?raw, "Peer connection lost");
                self.replace_after_failure().await;
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {}
        }
    }

    async fn on_ice_state(&mut self, ice: IceConnectionState) {
        let threshold = self.config.quality.good_video_bytes;
        let Some(handle) = self.current() else {
            return;
        };
        let inbound = match ice {
            IceConnectionState::Checking | IceConnectionState::Completed => {
                let stats = handle.peer().stats().await;
                InboundBytes {
                    video: stats.inbound_video_bytes(),
                    audio: stats.inbound_audio_bytes(),
                }
            }
            _ => InboundBytes::default(),
        };
        debug!(ice = ice.as_str(), "ICE connection state changed");
        self.monitor
            .set_quality(classify_quality(ice, inbound, threshold));
        if let Some(state) = ice_downgrade(ice) {
            self.monitor.set_state(state);
        }
        if ice == IceConnectionState::Failed {
            warn!("ICE failed, replacing peer connection");
            self.replace_after_failure().await;
        }
    }

    fn metrics_context(&self) -> Option<MetricsContext> {
        if !self.config.metrics.enabled {
            return None;
        }
        let sink = self.deps.metrics.as_ref()?;
        let active = self.session.as_ref()?;
        Some(MetricsContext::new(
            active.session.id.clone(),
            Arc::clone(sink),
            Arc::clone(&self.deps.token),
            &self.config.metrics,
        ))
    }

    async fn on_establishment_timeout(&mut self) {
        let timeout = self.config.negotiation.establishment_timeout();
        let Some(handle) = self.current() else {
            return;
        };
        let raw = handle.peer().connection_state();
        if raw == PeerConnectionState::Connected {
            return;
        }
        warn!(
            generation = handle.generation(),
            ?raw,
            "Connection not established in time"
        );
        report(&self.events, CallError::EstablishmentTimeout { timeout });
        self.replace_after_failure().await;
    }

    async fn on_disconnect_grace_elapsed(&mut self) {
        let Some(handle) = self.current() else {
            return;
        };
        if handle.peer().connection_state() != PeerConnectionState::Disconnected {
            return;
        }
        warn!(generation = handle.generation(), "Peer connection stayed disconnected");
        self.replace_after_failure().await;
    }

    /// Close the current handle, mark the call failed and schedule a rebuild.
    async fn replace_after_failure(&mut self) {
        if let Some(handle) = self.session.as_mut().and_then(|a| a.handle.take()) {
            handle.close().await;
        }
        self.monitor.set_state(CallState::Failed);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.session.is_none() {
            return;
        }
        let tx = self.tx.clone();
        self.reconnect.schedule(move |attempt| {
            let _ = tx.send(EngineEvent::ReconnectDue { attempt });
        });
    }

    async fn on_reconnect_due(&mut self, attempt: u32) {
        self.reconnect.fired();
        let Some(active) = self.session.as_mut() else {
            return;
        };
        if !self.deps.transport.is_connected() {
            warn!(attempt, "Signaling channel down, reconnection attempt aborted");
            self.schedule_reconnect();
            return;
        }

        info!(session_id = %active.session.id, attempt, "Rebuilding peer connection");
        if let Some(stale) = active.handle.take() {
            stale.close().await;
        }
        active.room_ready = false;
        let join = SignalingMessage::JoinRoom {
            session_id: active.session.id.clone(),
        };
        announce(&self.deps.transport, join).await;

        if let Err(e) = self.ensure_handle().await {
            report(&self.events, e);
            self.schedule_reconnect();
            return;
        }
        self.start_local_media(false).await;
    }

    async fn on_ice_restart(&mut self) {
        let Some(handle) = self.current() else {
            debug!("No peer connection, skipping ICE restart");
            return;
        };
        match handle.peer().connection_state() {
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                debug!("Peer connection is down, leaving recovery to reconnection");
            }
            _ => {
                info!(generation = handle.generation(), "Restarting ICE");
                self.begin_offer(true).await;
            }
        }
    }
}
