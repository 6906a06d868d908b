//! Call-related error types.

use crate::negotiation::engine::EngineError;
use crate::session::state::InvalidTransition;
use crate::signaling::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the session coordinator.
///
/// Duplicate, stale, and out-of-order signaling conditions never become a
/// `CallError`; they are absorbed by the state machine guards. A busy
/// collision is not an error either; it answers the new caller with an
/// automatic `call-reject`.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,

    #[error("no active call")]
    NoActiveCall,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("signaling transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),

    #[error("media negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("coordinator is shut down")]
    Shutdown,
}

impl From<EngineError> for CallError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            other => Self::NegotiationFailed(other.to_string()),
        }
    }
}
