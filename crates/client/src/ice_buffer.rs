//! Remote ICE candidates that arrived before the remote description.

use std::collections::VecDeque;

use duet_protocol::IceCandidateInit;
use tracing::{debug, warn};

use crate::peer::PeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied,
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

/// Arrival-ordered queue of remote candidates, private to one peer handle.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidateInit>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply `candidate` now if the remote description is set, otherwise
    /// queue it. A failed apply also queues, and the queue is re-checked
    /// afterwards in case the description landed meanwhile.
    pub async fn submit(
        &mut self,
        peer: &dyn PeerConnection,
        candidate: IceCandidateInit,
    ) -> SubmitOutcome {
        if peer.has_remote_description().await {
            match peer.add_ice_candidate(candidate.clone()).await {
                Ok(()) => {
                    debug!(candidate = %candidate.candidate, "Remote ICE candidate applied");
                    return SubmitOutcome::Applied;
                }
                Err(e) => {
                    warn!("Failed to apply ICE candidate, queueing: {e:#}");
                }
            }
        }

        self.pending.push_back(candidate);
        debug!(pending = self.pending.len(), "Remote ICE candidate queued");

        if peer.has_remote_description().await {
            self.flush(peer).await;
        }
        SubmitOutcome::Queued
    }

    /// Drain the whole queue in arrival order. No-op while the remote
    /// description is absent. A candidate that fails to apply is logged and
    /// dropped.
    pub async fn flush(&mut self, peer: &dyn PeerConnection) -> FlushReport {
        let mut report = FlushReport::default();
        if self.pending.is_empty() || !peer.has_remote_description().await {
            return report;
        }

        let drained: Vec<_> = self.pending.drain(..).collect();
        for candidate in drained {
            match peer.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Dropping queued ICE candidate: {e:#}");
                }
            }
        }
        debug!(
            applied = report.applied,
            failed = report.failed,
            "Flushed queued ICE candidates"
        );
        report
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
