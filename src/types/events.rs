//! App-facing call events.

use crate::session::state::{ActiveCallSession, CallPhase};
use crate::types::call::{CallId, EndCallReason};
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Events emitted by the session coordinator for the UI layer.
///
/// Duplicate, stale, and out-of-order signaling conditions are absorbed
/// inside the coordinator and never show up here; failures do.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An outgoing call left the coordinator.
    OutgoingStarted { session: ActiveCallSession },
    /// An incoming call is ringing locally.
    IncomingCall { session: ActiveCallSession },
    /// The session moved to a new phase.
    PhaseChanged { call_id: CallId, phase: CallPhase },
    /// Remote media started flowing.
    RemoteMedia { call_id: CallId },
    /// The local mute state changed.
    MuteChanged { call_id: CallId, muted: bool },
    /// A failure that tears the session down. `reason` distinguishes a
    /// connectivity problem from permission denial for user messaging.
    Failure {
        call_id: CallId,
        reason: EndCallReason,
        message: String,
    },
    /// The session is gone. Always the last event for a call id.
    Ended {
        call_id: CallId,
        reason: EndCallReason,
        duration_secs: Option<i64>,
    },
}

/// Broadcast fan-out for [`CallEvent`]s.
#[derive(Debug, Clone)]
pub struct CallEvents {
    tx: broadcast::Sender<CallEvent>,
}

impl CallEvents {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for CallEvents {
    fn default() -> Self {
        Self::new()
    }
}
