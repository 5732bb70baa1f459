//! Perfect-negotiation state machine for one peer connection.
//!
//! Offer collisions are settled by role alone: the first member ignores a
//! colliding offer, the second rolls its own offer back and answers.

use std::sync::Arc;

use duet_proto::{IceCandidate, Role, SdpType, SessionDescription, SignalKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::candidates::CandidateBuffer;
use crate::session::{EpochCheck, SessionTracker};
use crate::transport::{PeerConnection, SignalingState, TransportError};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed {kind:?} signal: {source}")]
    Malformed {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("negotiator is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    GeneratingOffer,
    /// Local offer applied, waiting for the answer.
    OfferPending,
    ApplyingRemoteOffer,
    ApplyingRemoteAnswer,
    RollingBack,
    Closed,
}

impl NegotiationPhase {
    pub fn making_offer(self) -> bool {
        self == NegotiationPhase::GeneratingOffer
    }

    pub fn answer_pending(self) -> bool {
        self == NegotiationPhase::ApplyingRemoteAnswer
    }
}

/// An incoming offer can be taken without rolling anything back.
pub fn ready_for_offer(phase: NegotiationPhase, signaling: SignalingState) -> bool {
    !phase.making_offer() && (signaling == SignalingState::Stable || phase.answer_pending())
}

pub fn offer_collision(is_offer: bool, ready: bool) -> bool {
    is_offer && !ready
}

pub fn should_ignore_offer(role: Role, collision: bool) -> bool {
    !role.is_polite() && collision
}

/// Decoded payload of a relayed signal.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePayload {
    Description(SessionDescription),
    Candidates(Vec<IceCandidate>),
}

#[derive(Serialize, Deserialize)]
struct CandidateBatchData {
    candidates: Vec<IceCandidate>,
}

impl RemotePayload {
    pub fn from_signal(kind: SignalKind, data: Value) -> Result<Self, NegotiationError> {
        let malformed = |source| NegotiationError::Malformed { kind, source };
        match kind {
            SignalKind::Description => serde_json::from_value(data)
                .map(RemotePayload::Description)
                .map_err(malformed),
            SignalKind::Candidate => serde_json::from_value(data)
                .map(|candidate| RemotePayload::Candidates(vec![candidate]))
                .map_err(malformed),
            SignalKind::CandidateBatch => serde_json::from_value::<CandidateBatchData>(data)
                .map(|batch| RemotePayload::Candidates(batch.candidates))
                .map_err(malformed),
        }
    }
}

/// A signal to be stamped by the session tracker and sent to the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub kind: SignalKind,
    pub data: Value,
}

impl OutboundSignal {
    pub fn description(desc: &SessionDescription) -> Self {
        Self {
            kind: SignalKind::Description,
            data: serde_json::to_value(desc).unwrap_or(Value::Null),
        }
    }

    pub fn candidates(candidates: Vec<IceCandidate>) -> Self {
        let data = serde_json::to_value(CandidateBatchData { candidates }).unwrap_or(Value::Null);
        Self {
            kind: SignalKind::CandidateBatch,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Older than the last epoch seen from the remote; nothing changed.
    Stale,
    /// A colliding offer dropped by the impolite side.
    Ignored,
    /// Description applied. Carries the local answer when it was an offer.
    Applied { answer: Option<SessionDescription> },
    /// The remote rebuilt its connection. The caller must rebuild too and
    /// hand `description` to the new negotiator.
    RemoteRestarted { description: SessionDescription },
    Candidates { applied: usize, queued: usize },
}

pub struct Negotiator {
    pc: Arc<dyn PeerConnection>,
    role: Role,
    phase: NegotiationPhase,
    ignore_offer: bool,
    /// Renegotiation requested while busy; the flag asks for an ICE restart.
    deferred: Option<bool>,
    candidates: CandidateBuffer,
    remote_applied_epoch: Option<u64>,
}

impl Negotiator {
    pub fn new(pc: Arc<dyn PeerConnection>, role: Role) -> Self {
        Self {
            pc,
            role,
            phase: NegotiationPhase::Idle,
            ignore_offer: false,
            deferred: None,
            candidates: CandidateBuffer::new(),
            remote_applied_epoch: None,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.pc
    }

    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_idle(&self) -> bool {
        self.phase == NegotiationPhase::Idle && self.pc.signaling_state() == SignalingState::Stable
    }

    /// React to a local renegotiation request. Returns the offer to send, or
    /// `None` when the request was deferred.
    pub async fn negotiation_needed(
        &mut self,
        ice_restart: bool,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        if !self.is_idle() {
            let restart = self.deferred.unwrap_or(false) || ice_restart;
            self.deferred = Some(restart);
            debug!(
                target = "duet::negotiation",
                phase = ?self.phase,
                signaling = ?self.pc.signaling_state(),
                ice_restart = restart,
                "negotiation busy; deferring"
            );
            return Ok(None);
        }

        self.phase = NegotiationPhase::GeneratingOffer;
        let result = self.make_offer(ice_restart).await;
        self.phase = match &result {
            Ok(_) => NegotiationPhase::OfferPending,
            Err(_) => NegotiationPhase::Idle,
        };
        let offer = result?;
        debug!(target = "duet::negotiation", role = %self.role, ice_restart, "local offer applied");
        Ok(Some(offer))
    }

    async fn make_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(ice_restart).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Issue an ICE-restart offer if nothing else is in flight.
    pub async fn restart_ice(&mut self) -> Result<Option<SessionDescription>, NegotiationError> {
        if !self.is_idle() {
            debug!(target = "duet::negotiation", phase = ?self.phase, "restart skipped; negotiation busy");
            return Ok(None);
        }
        self.negotiation_needed(true).await
    }

    /// Track signaling transitions. Returns a deferred renegotiation request
    /// that may now be retried.
    pub fn on_signaling_state(&mut self, state: SignalingState) -> Option<bool> {
        trace!(target = "duet::negotiation", ?state, phase = ?self.phase, "signaling state");
        if state != SignalingState::Stable {
            return None;
        }
        if self.phase == NegotiationPhase::OfferPending {
            // Rolled back or answered outside `handle_remote`.
            self.phase = NegotiationPhase::Idle;
        }
        if self.phase == NegotiationPhase::Idle {
            self.deferred.take()
        } else {
            None
        }
    }

    pub async fn handle_remote(
        &mut self,
        session: &mut SessionTracker,
        epoch: u64,
        payload: RemotePayload,
    ) -> Result<RemoteOutcome, NegotiationError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        if session.observe_remote_epoch(epoch) == EpochCheck::Stale {
            debug!(
                target = "duet::negotiation",
                epoch,
                remote_epoch = ?session.remote_epoch(),
                "dropping stale signal"
            );
            return Ok(RemoteOutcome::Stale);
        }
        match payload {
            RemotePayload::Description(desc) => self.handle_description(epoch, desc).await,
            RemotePayload::Candidates(candidates) => Ok(self.handle_candidates(candidates).await),
        }
    }

    async fn handle_description(
        &mut self,
        epoch: u64,
        desc: SessionDescription,
    ) -> Result<RemoteOutcome, NegotiationError> {
        if self.remote_applied_epoch.is_some_and(|applied| epoch > applied) {
            info!(
                target = "duet::negotiation",
                epoch,
                applied = ?self.remote_applied_epoch,
                "remote rebuilt its connection"
            );
            return Ok(RemoteOutcome::RemoteRestarted { description: desc });
        }

        let is_offer = desc.is_offer();
        let ready = ready_for_offer(self.phase, self.pc.signaling_state());
        let collision = offer_collision(is_offer, ready);
        self.ignore_offer = should_ignore_offer(self.role, collision);
        if self.ignore_offer {
            info!(target = "duet::negotiation", role = %self.role, "ignoring colliding offer");
            return Ok(RemoteOutcome::Ignored);
        }

        if collision {
            info!(target = "duet::negotiation", role = %self.role, "offer collision; rolling back");
            self.phase = NegotiationPhase::RollingBack;
            if let Err(err) = self.pc.rollback().await {
                self.phase = NegotiationPhase::Idle;
                return Err(err.into());
            }
        }

        self.phase = if desc.sdp_type == SdpType::Answer {
            NegotiationPhase::ApplyingRemoteAnswer
        } else {
            NegotiationPhase::ApplyingRemoteOffer
        };
        let result = self.apply_description(desc, is_offer).await;
        self.phase = match self.pc.signaling_state() {
            SignalingState::HaveLocalOffer => NegotiationPhase::OfferPending,
            SignalingState::Closed => NegotiationPhase::Closed,
            _ => NegotiationPhase::Idle,
        };
        let answer = result?;
        self.remote_applied_epoch = Some(epoch);
        self.flush_candidates().await;
        Ok(RemoteOutcome::Applied { answer })
    }

    async fn apply_description(
        &self,
        desc: SessionDescription,
        is_offer: bool,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        self.pc.set_remote_description(desc).await?;
        if !is_offer {
            return Ok(None);
        }
        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(Some(answer))
    }

    async fn handle_candidates(&mut self, candidates: Vec<IceCandidate>) -> RemoteOutcome {
        let mut applied = 0;
        let mut queued = 0;
        let hold = self.ignore_offer
            || self.phase == NegotiationPhase::ApplyingRemoteAnswer
            || !self.pc.has_remote_description().await;
        for candidate in candidates {
            if hold {
                if self.candidates.offer(candidate) {
                    queued += 1;
                }
                continue;
            }
            if !self.candidates.admit(&candidate) {
                continue;
            }
            match self.pc.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(err) if self.ignore_offer => {
                    trace!(target = "duet::negotiation", error = %err, "candidate error while ignoring offer");
                }
                Err(err) => {
                    warn!(target = "duet::negotiation", error = %err, "failed to add remote candidate");
                }
            }
        }
        RemoteOutcome::Candidates { applied, queued }
    }

    async fn flush_candidates(&mut self) {
        for candidate in self.candidates.on_remote_description_applied() {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                warn!(target = "duet::negotiation", error = %err, "failed to add buffered candidate");
            }
        }
    }

    pub async fn close(&mut self) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        self.phase = NegotiationPhase::Closed;
        self.deferred = None;
        self.candidates.reset();
        if let Err(err) = self.pc.close().await {
            debug!(target = "duet::negotiation", error = %err, "error closing peer connection");
        }
    }
}
