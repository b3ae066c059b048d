//! Bounded rebuild of the peer connection after failure.

use std::time::Duration;

use duet_protocol::ReconnectConfig;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-indexed): `min(base * 2^(n-1), cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { attempt: u32, delay: Duration },
    AlreadyPending,
    Exhausted,
}

/// Attempt counter and pending timer of the current session.
#[derive(Debug)]
pub struct ReconnectionController {
    policy: ReconnectPolicy,
    attempts: u32,
    pending: Option<JoinHandle<()>>,
}

impl ReconnectionController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            pending: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Arm the next attempt; `due` runs once its delay has elapsed.
    pub fn schedule<F>(&mut self, due: F) -> ScheduleOutcome
    where
        F: FnOnce(u32) + Send + 'static,
    {
        if self.is_pending() {
            return ScheduleOutcome::AlreadyPending;
        }
        if self.attempts >= self.policy.max_attempts {
            info!(
                attempts = self.attempts,
                "Reconnection attempts exhausted, waiting for user action"
            );
            return ScheduleOutcome::Exhausted;
        }
        self.attempts += 1;
        let attempt = self.attempts;
        let delay = self.policy.delay(attempt);
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnection scheduled"
        );
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            due(attempt);
        }));
        ScheduleOutcome::Scheduled { attempt, delay }
    }

    /// The pending timer fired.
    pub fn fired(&mut self) {
        self.pending = None;
    }

    /// A rebuilt connection came up cleanly.
    pub fn on_connected(&mut self) {
        if self.attempts > 0 {
            info!(attempts = self.attempts, "Reconnected");
        }
        self.reset();
    }

    /// Clear the counter and cancel any pending attempt.
    pub fn reset(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.abort();
        }
        self.attempts = 0;
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.abort();
        }
    }
}
