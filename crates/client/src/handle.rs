//! One live peer connection and everything scoped to it.

use std::sync::Arc;
use std::time::Duration;

use duet_protocol::{IceCandidateInit, SessionDescription};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::call::EngineEvent;
use crate::dispatcher::Dispatcher;
use crate::metrics::{MetricsCollector, MetricsContext};
use crate::negotiation::Negotiator;
use crate::peer::{PeerConnection, PeerParts};

/// A peer connection with its negotiator, dispatcher, timers and metrics.
///
/// Every task the handle spawns lives in its [`JoinSet`], so closing or
/// dropping the handle cancels all of them. Events it feeds back to the
/// engine carry its generation; the engine ignores generations other than
/// the current one.
pub struct PeerHandle {
    generation: u64,
    peer: Arc<dyn PeerConnection>,
    pub negotiator: Negotiator,
    dispatcher: Dispatcher,
    engine: mpsc::UnboundedSender<EngineEvent>,
    tasks: JoinSet<()>,
    establishment: Option<AbortHandle>,
    disconnect_grace: Option<AbortHandle>,
    offer: Option<AbortHandle>,
    metrics: Option<MetricsCollector>,
}

impl PeerHandle {
    pub(crate) fn new(
        generation: u64,
        parts: PeerParts,
        dispatcher: Dispatcher,
        engine: mpsc::UnboundedSender<EngineEvent>,
        establishment_timeout: Duration,
    ) -> Self {
        let PeerParts { peer, mut events } = parts;
        let mut tasks = JoinSet::new();

        let tx = engine.clone();
        tasks.spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(EngineEvent::Peer { generation, event }).is_err() {
                    break;
                }
            }
        });

        let tx = engine.clone();
        let establishment = tasks.spawn(async move {
            tokio::time::sleep(establishment_timeout).await;
            let _ = tx.send(EngineEvent::EstablishmentTimeout { generation });
        });

        Self {
            generation,
            peer,
            negotiator: Negotiator::new(),
            dispatcher,
            engine,
            tasks,
            establishment: Some(establishment),
            disconnect_grace: None,
            offer: None,
            metrics: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    fn reap(&mut self) {
        while self.tasks.try_join_next().is_some() {}
    }

    /// Deliver an offer in the background. A previous in-flight offer is
    /// superseded.
    pub fn spawn_offer(&mut self, offer: SessionDescription) {
        self.reap();
        self.cancel_offer();
        let dispatcher = self.dispatcher.clone();
        let tx = self.engine.clone();
        let generation = self.generation;
        self.offer = Some(self.tasks.spawn(async move {
            if let Err(error) = dispatcher.send_offer(offer).await {
                let _ = tx.send(EngineEvent::OfferFailed { generation, error });
            }
        }));
    }

    pub fn spawn_answer(&mut self, answer: SessionDescription) {
        self.reap();
        let dispatcher = self.dispatcher.clone();
        let tx = self.engine.clone();
        let generation = self.generation;
        self.tasks.spawn(async move {
            if let Err(error) = dispatcher.send_answer(answer).await {
                let _ = tx.send(EngineEvent::AnswerFailed { generation, error });
            }
        });
    }

    pub fn spawn_candidate(&mut self, candidate: IceCandidateInit) {
        self.reap();
        let dispatcher = self.dispatcher.clone();
        self.tasks.spawn(async move {
            dispatcher.send_candidate(candidate).await;
        });
    }

    pub fn cancel_offer(&mut self) {
        if let Some(task) = self.offer.take() {
            task.abort();
        }
    }

    pub fn cancel_establishment(&mut self) {
        if let Some(timer) = self.establishment.take() {
            timer.abort();
            debug!(generation = self.generation, "Establishment timer cleared");
        }
    }

    /// Start the grace period for a `disconnected` connection, unless one
    /// is already running.
    pub fn arm_disconnect_grace(&mut self, grace: Duration) {
        if self
            .disconnect_grace
            .as_ref()
            .is_some_and(|t| !t.is_finished())
        {
            return;
        }
        let tx = self.engine.clone();
        let generation = self.generation;
        self.disconnect_grace = Some(self.tasks.spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(EngineEvent::DisconnectGraceElapsed { generation });
        }));
    }

    pub fn cancel_disconnect_grace(&mut self) {
        if let Some(timer) = self.disconnect_grace.take() {
            timer.abort();
        }
    }

    pub fn start_metrics(&mut self, ctx: MetricsContext) {
        if self.metrics.is_none() {
            self.metrics = Some(MetricsCollector::start(ctx, Arc::clone(&self.peer)));
        }
    }

    /// Cancel every timer and task, then close the connection.
    pub async fn close(mut self) {
        self.tasks.abort_all();
        self.establishment = None;
        self.disconnect_grace = None;
        self.offer = None;
        if let Some(metrics) = self.metrics.take()
            && let Some(flush) = metrics.stop()
        {
            // The final flush runs detached; its timers are already stopped.
            let generation = self.generation;
            tokio::spawn(async move {
                if let Err(e) = flush.await
                    && e.is_panic()
                {
                    warn!(generation, "Final metrics flush panicked: {e}");
                }
            });
        }
        self.negotiator.close();
        if let Err(e) = self.peer.close().await {
            warn!(generation = self.generation, "Failed to close peer connection: {e:#}");
        }
        info!(generation = self.generation, "Peer handle closed");
    }
}
