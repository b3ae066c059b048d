//! Offer/answer negotiation for one peer handle.
//!
//! [`transition`] is the whole tie-break policy: a signaling event either
//! moves the negotiation to a new state or is dropped with a reason.
//! [`Negotiator`] runs the SDP steps behind an accepted transition and
//! keeps the pending remote candidates of its connection.

use duet_protocol::{IceCandidateInit, SessionDescription};
use tracing::{debug, info, warn};

use crate::error::{CallError, NegotiationStep};
use crate::ice_buffer::{IceCandidateBuffer, SubmitOutcome};
use crate::media::{LocalMedia, LocalMediaSlot};
use crate::peer::{PeerConnection, SignalingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl From<SignalingState> for NegotiationState {
    fn from(state: SignalingState) -> Self {
        match state {
            SignalingState::Stable => NegotiationState::Stable,
            SignalingState::HaveLocalOffer | SignalingState::HaveLocalPranswer => {
                NegotiationState::HaveLocalOffer
            }
            SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer => {
                NegotiationState::HaveRemoteOffer
            }
            SignalingState::Closed => NegotiationState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Local intent to call.
    LocalOffer,
    /// Offer that regathers candidates on the live connection.
    IceRestart,
    RemoteOffer,
    /// The local answer to the remote offer was applied.
    LocalAnswer,
    RemoteAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A local offer is already in flight.
    AlreadyOffering,
    /// Both sides offered; ours wins.
    OfferCollision,
    DuplicateOffer,
    /// A remote offer is being answered.
    Answering,
    UnexpectedAnswer,
    NotStable,
    Closed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DropReason::AlreadyOffering => "local offer already in flight",
            DropReason::OfferCollision => "remote offer collides with local offer",
            DropReason::DuplicateOffer => "duplicate remote offer",
            DropReason::Answering => "remote offer is being answered",
            DropReason::UnexpectedAnswer => "answer without outstanding offer",
            DropReason::NotStable => "negotiation not stable",
            DropReason::Closed => "connection closed",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accept(NegotiationState),
    Drop(DropReason),
}

pub fn transition(state: NegotiationState, event: SignalEvent) -> Transition {
    use NegotiationState::*;
    use SignalEvent::*;

    match (state, event) {
        (Closed, _) => Transition::Drop(DropReason::Closed),

        (Stable, LocalOffer | IceRestart) => Transition::Accept(HaveLocalOffer),
        (HaveLocalOffer, LocalOffer) => Transition::Drop(DropReason::AlreadyOffering),
        (HaveRemoteOffer, LocalOffer) => Transition::Drop(DropReason::Answering),
        (_, IceRestart) => Transition::Drop(DropReason::NotStable),

        (Stable, RemoteOffer) => Transition::Accept(HaveRemoteOffer),
        (HaveLocalOffer, RemoteOffer) => Transition::Drop(DropReason::OfferCollision),
        (HaveRemoteOffer, RemoteOffer) => Transition::Drop(DropReason::DuplicateOffer),

        (HaveRemoteOffer, LocalAnswer) => Transition::Accept(Stable),
        (_, LocalAnswer) => Transition::Drop(DropReason::NotStable),

        (HaveLocalOffer, RemoteAnswer) => Transition::Accept(Stable),
        (_, RemoteAnswer) => Transition::Drop(DropReason::UnexpectedAnswer),
    }
}

/// Negotiation state of one peer connection.
#[derive(Debug)]
pub struct Negotiator {
    state: NegotiationState,
    candidates: IceCandidateBuffer,
    media_attached: bool,
    /// SDP of the last applied remote offer, to spot a redelivery.
    last_remote_offer: Option<String>,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Stable,
            candidates: IceCandidateBuffer::new(),
            media_attached: false,
            last_remote_offer: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn media_attached(&self) -> bool {
        self.media_attached
    }

    fn check(&self, event: SignalEvent) -> Option<NegotiationState> {
        match transition(self.state, event) {
            Transition::Accept(next) => Some(next),
            Transition::Drop(reason) => {
                warn!(state = ?self.state, ?event, "Dropping signaling event: {reason}");
                None
            }
        }
    }

    /// Re-read the state from the connection after a failed step.
    fn resync(&mut self, peer: &dyn PeerConnection) {
        let actual = NegotiationState::from(peer.signaling_state());
        if actual != self.state {
            debug!(from = ?self.state, to = ?actual, "Negotiation state resynced");
        }
        self.state = actual;
    }

    fn fail(
        &mut self,
        peer: &dyn PeerConnection,
        step: NegotiationStep,
        err: anyhow::Error,
    ) -> CallError {
        self.resync(peer);
        CallError::negotiation(step, &err)
    }

    /// Attach local tracks once per connection.
    pub async fn attach_local_media(
        &mut self,
        peer: &dyn PeerConnection,
        media: &LocalMedia,
    ) -> Result<(), CallError> {
        if self.media_attached {
            return Ok(());
        }
        peer.add_local_media(media)
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::AttachMedia, &e))?;
        self.media_attached = true;
        info!(stream_id = %media.stream_id, "Local media attached");
        Ok(())
    }

    /// Create and apply a local offer. `Ok(None)` when the intent was
    /// suppressed by the current state.
    pub async fn create_offer(
        &mut self,
        peer: &dyn PeerConnection,
        ice_restart: bool,
    ) -> Result<Option<SessionDescription>, CallError> {
        let event = if ice_restart {
            SignalEvent::IceRestart
        } else {
            SignalEvent::LocalOffer
        };
        let Some(next) = self.check(event) else {
            return Ok(None);
        };

        let offer = match peer.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(peer, NegotiationStep::CreateOffer, e)),
        };
        if let Err(e) = peer.set_local_description(offer.clone()).await {
            return Err(self.fail(peer, NegotiationStep::SetLocalDescription, e));
        }
        self.state = next;
        info!(ice_restart, "Local offer created");
        Ok(Some(offer))
    }

    /// Apply a remote offer and produce the answer. Local media is acquired
    /// first if the session has none yet; a media failure aborts this round
    /// and leaves the connection untouched.
    pub async fn accept_offer(
        &mut self,
        peer: &dyn PeerConnection,
        media: &mut LocalMediaSlot,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, CallError> {
        if self.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            warn!(
                ufrag = ?offer.ice_ufrag(),
                "Dropping signaling event: {}",
                DropReason::DuplicateOffer
            );
            return Ok(None);
        }
        let Some(next) = self.check(SignalEvent::RemoteOffer) else {
            return Ok(None);
        };

        let local = media.ensure().await?;
        self.attach_local_media(peer, local).await?;

        let sdp = offer.sdp.clone();
        if let Err(e) = peer.set_remote_description(offer).await {
            return Err(self.fail(peer, NegotiationStep::SetRemoteDescription, e));
        }
        self.state = next;
        self.last_remote_offer = Some(sdp);
        self.candidates.flush(peer).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(peer, NegotiationStep::CreateAnswer, e)),
        };
        if let Err(e) = peer.set_local_description(answer.clone()).await {
            return Err(self.fail(peer, NegotiationStep::SetLocalDescription, e));
        }
        if let Some(next) = self.check(SignalEvent::LocalAnswer) {
            self.state = next;
        }
        info!("Remote offer applied, answer created");
        Ok(Some(answer))
    }

    /// Apply the partner's answer to our outstanding offer. Returns whether
    /// it was applied.
    pub async fn accept_answer(
        &mut self,
        peer: &dyn PeerConnection,
        answer: SessionDescription,
    ) -> Result<bool, CallError> {
        let Some(next) = self.check(SignalEvent::RemoteAnswer) else {
            return Ok(false);
        };
        if let Err(e) = peer.set_remote_description(answer).await {
            return Err(self.fail(peer, NegotiationStep::SetRemoteDescription, e));
        }
        self.state = next;
        self.candidates.flush(peer).await;
        info!("Remote answer applied");
        Ok(true)
    }

    pub async fn submit_candidate(
        &mut self,
        peer: &dyn PeerConnection,
        candidate: IceCandidateInit,
    ) -> SubmitOutcome {
        if self.state == NegotiationState::Closed {
            debug!("Ignoring ICE candidate for closed connection");
            return SubmitOutcome::Queued;
        }
        self.candidates.submit(peer, candidate).await
    }

    pub fn close(&mut self) {
        self.state = NegotiationState::Closed;
        self.candidates.clear();
    }
}
