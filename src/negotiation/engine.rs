//! The peer-connection media engine capability.
//!
//! The engine owns the actual audio/video path: local media, session
//! descriptions, ICE, and the transport state. It is consumed through the
//! [`MediaEngine`] trait so the coordinator can be driven against the real
//! WebRTC implementation or a mock. One engine instance exists per call;
//! a fresh one is created through [`MediaEngineFactory`] when negotiation
//! starts and closed by teardown.

use crate::signaling::message::IceCandidate;
use crate::types::call::MediaKind;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid session description: {0}")]
    Sdp(String),

    #[error("ice candidate rejected: {0}")]
    Ice(String),

    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error("engine is closed")]
    Closed,
}

/// Kind of a remote session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Transport state of the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

/// Events surfaced by the engine, asynchronously relative to the
/// offer/answer exchange.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A locally gathered ICE candidate. Must be forwarded to the peer
    /// immediately; the receiving side buffers candidates that arrive
    /// before its remote description.
    IceCandidate(IceCandidate),
    /// The peer connection's transport state changed.
    ConnectionState(ConnectionState),
    /// A remote media track started flowing.
    RemoteMedia,
}

/// Peer-connection media engine consumed by the session coordinator.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire local capture media for the given kind. Fails with
    /// [`EngineError::PermissionDenied`] when device access is refused;
    /// the session is then torn down without retrying.
    async fn acquire_media(&self, kind: MediaKind) -> Result<(), EngineError>;

    /// Stop and release local capture media. Safe to call repeatedly.
    async fn release_media(&self);

    /// Mute or unmute the local media. Also serves as the hold substitute,
    /// since the engine has no native hold primitive.
    async fn set_muted(&self, muted: bool);

    /// Create an SDP offer and install it as the local description.
    async fn create_offer(&self) -> Result<String, EngineError>;

    /// Create an SDP answer to the current remote offer and install it as
    /// the local description.
    async fn create_answer(&self) -> Result<String, EngineError>;

    /// Install the peer's session description.
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), EngineError>;

    /// Apply a remote ICE candidate. Callers are responsible for queueing
    /// candidates until the remote description is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Close the peer connection. Idempotent; always safe to call, even
    /// with no active negotiation.
    async fn close(&self);

    /// Subscribe to engine events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Creates one engine per call session.
pub trait MediaEngineFactory: Send + Sync {
    fn create_engine(&self) -> Arc<dyn MediaEngine>;
}
