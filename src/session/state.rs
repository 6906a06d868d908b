//! Call session state machine.
//!
//! `Idle` is the absence of a session: the coordinator holds no
//! [`ActiveCallSession`] at all. A session is created directly in
//! `OutgoingRequested` or `IncomingOffered` and destroyed by teardown
//! after reaching `Ended`.

use crate::types::call::{
    AccountId, CallDirection, CallId, EndCallReason, MediaKind, RoomId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current phase of an active call.
#[derive(Debug, Clone, Serialize)]
pub enum CallPhase {
    /// Outgoing call: request sent, nothing heard from the callee yet.
    OutgoingRequested { requested_at: DateTime<Utc> },
    /// Outgoing call: the callee's device reported it is alerting.
    OutgoingRinging { ringing_since: DateTime<Utc> },
    /// Incoming call: ringing locally, waiting for a local decision.
    IncomingOffered { received_at: DateTime<Utc> },
    /// Both sides accepted; media negotiation in progress.
    Connecting { accepted_at: DateTime<Utc> },
    /// Media flowing.
    Connected {
        accepted_at: DateTime<Utc>,
        connected_at: DateTime<Utc>,
    },
    /// The call is over.
    Ended {
        reason: EndCallReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallPhase {
    pub fn is_ringing(&self) -> bool {
        matches!(
            self,
            Self::OutgoingRequested { .. } | Self::OutgoingRinging { .. } | Self::IncomingOffered { .. }
        )
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Connected { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingOffered { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::IncomingOffered { .. })
    }

    /// Acceptance time, used for duration accounting.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Connecting { accepted_at } | Self::Connected { accepted_at, .. } => {
                Some(*accepted_at)
            }
            _ => None,
        }
    }
}

/// State transitions for calls. Each consumes exactly one signal, local
/// action, or engine event.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// `call-ringing` received from the room. Advisory only.
    RemoteRinging,
    /// `call-accept` received from the room.
    RemoteAccepted,
    /// Local accept action on an incoming call.
    LocalAccepted,
    /// The engine reported a connected transport.
    MediaConnected,
    /// Any end path: local action, peer signal, engine failure, timeout.
    Terminated { reason: EndCallReason },
}

/// Attempted transition not permitted by the current phase.
///
/// Whether this is an error or an ignorable duplicate is the caller's
/// decision: out-of-order signals are logged and dropped, local actions
/// surface it.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The single in-memory record of the active call.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCallSession {
    pub call_id: CallId,
    pub room_id: RoomId,
    pub peer_id: AccountId,
    pub peer_name: Option<String>,
    pub media_kind: MediaKind,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub is_muted: bool,
    pub is_minimized: bool,
    pub created_at: DateTime<Utc>,
}

impl ActiveCallSession {
    pub fn new_outgoing(
        call_id: CallId,
        room_id: RoomId,
        peer_id: AccountId,
        peer_name: Option<String>,
        media_kind: MediaKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            room_id,
            peer_id,
            peer_name,
            media_kind,
            direction: CallDirection::Outgoing,
            phase: CallPhase::OutgoingRequested { requested_at: now },
            is_muted: false,
            is_minimized: false,
            created_at: now,
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        room_id: RoomId,
        peer_id: AccountId,
        peer_name: Option<String>,
        media_kind: MediaKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            room_id,
            peer_id,
            peer_name,
            media_kind,
            direction: CallDirection::Incoming,
            phase: CallPhase::IncomingOffered { received_at: now },
            is_muted: false,
            is_minimized: false,
            created_at: now,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Apply a state transition. Returns an error if the current phase
    /// does not permit it; the session is unchanged in that case.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, &transition) {
            (CallPhase::OutgoingRequested { .. }, CallTransition::RemoteRinging) => {
                CallPhase::OutgoingRinging {
                    ringing_since: Utc::now(),
                }
            }
            (
                CallPhase::OutgoingRequested { .. } | CallPhase::OutgoingRinging { .. },
                CallTransition::RemoteAccepted,
            ) => CallPhase::Connecting {
                accepted_at: Utc::now(),
            },
            (CallPhase::IncomingOffered { .. }, CallTransition::LocalAccepted) => {
                CallPhase::Connecting {
                    accepted_at: Utc::now(),
                }
            }
            (CallPhase::Connecting { accepted_at }, CallTransition::MediaConnected) => {
                CallPhase::Connected {
                    accepted_at: *accepted_at,
                    connected_at: Utc::now(),
                }
            }
            (CallPhase::Ended { .. }, _) => {
                return Err(self.rejected(&transition));
            }
            (_, CallTransition::Terminated { reason }) => {
                let ended_at = Utc::now();
                let duration_secs = self
                    .phase
                    .start_time()
                    .map(|start| ended_at.signed_duration_since(start).num_seconds());
                CallPhase::Ended {
                    reason: *reason,
                    ended_at,
                    duration_secs,
                }
            }
            _ => return Err(self.rejected(&transition)),
        };
        self.phase = new_phase;
        Ok(())
    }

    fn rejected(&self, transition: &CallTransition) -> InvalidTransition {
        InvalidTransition {
            current_phase: format!("{:?}", self.phase),
            attempted: format!("{:?}", transition),
        }
    }
}
