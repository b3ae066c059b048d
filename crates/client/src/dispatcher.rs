//! Delivery of offers, answers and candidates over the signaling channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duet_protocol::{
    EventKind, IceCandidateInit, NegotiationConfig, SessionDescription, SignalingMessage,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::transport::SignalingTransport;

/// Attempt budget and backoff for offer/answer delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(5000),
        }
    }
}

impl From<&NegotiationConfig> for RetryPolicy {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            max_attempts: config.max_send_attempts,
            base: config.retry_base(),
            cap: config.retry_cap(),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-indexed): `min(base * 2^n, cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// At most one first-attempt offer per window. Callers reserve the next
/// free slot, so concurrent offers queue up behind each other.
#[derive(Debug)]
pub struct OfferRateLimiter {
    window: Duration,
    last_slot: Option<Instant>,
}

impl OfferRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_slot: None,
        }
    }

    /// Reserve a send slot; returns how long to wait for it.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        let slot = match self.last_slot {
            Some(last) => (last + self.window).max(now),
            None => now,
        };
        self.last_slot = Some(slot);
        slot - now
    }
}

pub type SharedRateLimiter = Arc<Mutex<OfferRateLimiter>>;

/// Consecutive-failure counters of one peer handle.
#[derive(Debug, Default)]
pub struct RetryCounters {
    offer: AtomicU32,
    answer: AtomicU32,
}

impl RetryCounters {
    fn slot(&self, kind: EventKind) -> Option<&AtomicU32> {
        match kind {
            EventKind::Offer => Some(&self.offer),
            EventKind::Answer => Some(&self.answer),
            _ => None,
        }
    }

    pub fn get(&self, kind: EventKind) -> u32 {
        self.slot(kind).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn increment(&self, kind: EventKind) -> u32 {
        self.slot(kind)
            .map_or(1, |c| c.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn reset(&self, kind: EventKind) {
        if let Some(c) = self.slot(kind) {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Sends the negotiation messages of one peer handle.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn SignalingTransport>,
    session_id: String,
    policy: RetryPolicy,
    limiter: SharedRateLimiter,
    counters: Arc<RetryCounters>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        session_id: impl Into<String>,
        policy: RetryPolicy,
        limiter: SharedRateLimiter,
    ) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            policy,
            limiter,
            counters: Arc::new(RetryCounters::default()),
        }
    }

    pub fn counters(&self) -> &RetryCounters {
        &self.counters
    }

    /// Send an offer, waiting out the rate-limit window first. Retries
    /// after a failed send are not rate limited.
    pub async fn send_offer(&self, offer: SessionDescription) -> Result<(), DispatchError> {
        let wait = {
            let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
            limiter.reserve(Instant::now())
        };
        if !wait.is_zero() {
            info!(
                session_id = %self.session_id,
                wait_ms = wait.as_millis() as u64,
                "Offer rate limited, waiting for window"
            );
            tokio::time::sleep(wait).await;
        }
        self.deliver(SignalingMessage::Offer {
            session_id: self.session_id.clone(),
            offer,
        })
        .await
    }

    pub async fn send_answer(&self, answer: SessionDescription) -> Result<(), DispatchError> {
        self.deliver(SignalingMessage::Answer {
            session_id: self.session_id.clone(),
            answer,
        })
        .await
    }

    /// Fire-and-forget: a lost candidate is logged, never retried.
    pub async fn send_candidate(&self, candidate: IceCandidateInit) {
        let message = SignalingMessage::IceCandidate {
            session_id: self.session_id.clone(),
            candidate,
        };
        match self.transport.send(message).await {
            Ok(()) => debug!(session_id = %self.session_id, "Local ICE candidate sent"),
            Err(e) => warn!(session_id = %self.session_id, "Failed to send ICE candidate: {e}"),
        }
    }

    async fn deliver(&self, message: SignalingMessage) -> Result<(), DispatchError> {
        let kind = message.kind();
        loop {
            match self.transport.send(message.clone()).await {
                Ok(()) => {
                    let failures = self.counters.get(kind);
                    self.counters.reset(kind);
                    info!(session_id = %self.session_id, event = %kind, retries = failures, "Signaling message delivered");
                    return Ok(());
                }
                Err(e) => {
                    let attempts = self.counters.increment(kind);
                    if attempts >= self.policy.max_attempts {
                        self.counters.reset(kind);
                        error!(
                            session_id = %self.session_id,
                            event = %kind,
                            attempts,
                            "Giving up: {e}"
                        );
                        return Err(DispatchError {
                            kind,
                            attempts,
                            last: e,
                        });
                    }
                    let delay = self.policy.delay(attempts - 1);
                    warn!(
                        session_id = %self.session_id,
                        event = %kind,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Send failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
