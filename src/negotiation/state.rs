//! Offer/answer guard state for one negotiation.
//!
//! The signaling transport gives no ordering between the room channel and
//! engine callbacks, so every description and candidate is checked against
//! this state before it reaches the media engine. Signals that do not fit
//! the current phase are discarded as duplicates or glare, never applied.

use crate::signaling::message::IceCandidate;
use std::collections::VecDeque;

/// Phase of the offer/answer exchange, mirroring the engine's signaling
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingPhase {
    /// No exchange in progress.
    #[default]
    Stable,
    /// We created an offer and are waiting for the peer's answer.
    HaveLocalOffer,
    /// We applied the peer's offer and owe them an answer.
    HaveRemoteOffer,
    /// The negotiation was closed; nothing may be applied any more.
    Closed,
}

/// Guard state scoped to one active call session.
#[derive(Debug, Default)]
pub struct NegotiationState {
    phase: SignalingPhase,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// True if an incoming offer may be applied. Rejecting offers outside
    /// the stable phase is what prevents glare.
    pub fn can_apply_remote_offer(&self) -> bool {
        self.phase == SignalingPhase::Stable
    }

    /// True if an incoming answer may be applied: only while a locally
    /// created offer is outstanding.
    pub fn can_apply_answer(&self) -> bool {
        self.phase == SignalingPhase::HaveLocalOffer
    }

    /// Record that a local offer was created and sent.
    pub fn note_local_offer(&mut self) {
        self.phase = SignalingPhase::HaveLocalOffer;
    }

    /// Record that the peer's offer was applied as remote description.
    pub fn note_remote_offer(&mut self) {
        self.phase = SignalingPhase::HaveRemoteOffer;
        self.remote_description_set = true;
    }

    /// Record that the peer's answer was applied as remote description.
    pub fn note_answer_applied(&mut self) {
        self.phase = SignalingPhase::Stable;
        self.remote_description_set = true;
    }

    /// Record that our answer to a remote offer was created and sent.
    pub fn note_answer_created(&mut self) {
        self.phase = SignalingPhase::Stable;
    }

    /// Queue a candidate that arrived before the remote description.
    pub fn push_pending(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push_back(candidate);
    }

    /// Take all queued candidates in their original arrival order.
    pub fn drain_pending(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Close the negotiation: drop queued candidates and refuse further
    /// descriptions.
    pub fn close(&mut self) {
        self.phase = SignalingPhase::Closed;
        self.pending_candidates.clear();
    }
}
