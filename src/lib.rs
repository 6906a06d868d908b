//! Peer-to-peer call session orchestration.
//!
//! Negotiates and supervises a single real-time audio/video session
//! between two accounts: best-effort pub/sub signaling on one side, a
//! WebRTC peer connection on the other, with a strict state machine in
//! between. The hard part is that the state machine is split across two
//! independently running processes over an unordered, at-most-once
//! transport, and that native call UI, media devices, and the session
//! record must stay consistent on every exit path.
//!
//! # Architecture
//!
//! - [`signaling`]: the [`CallSignal`] wire record, the
//!   [`SignalingTransport`] pub/sub capability, and an in-memory broker.
//! - [`session`]: the call phase state machine and the
//!   [`CallSessionCoordinator`], a single-task actor owning the one
//!   active session per account.
//! - [`negotiation`]: offer/answer guards with receiver-side ICE
//!   candidate buffering, the [`MediaEngine`] capability, and its WebRTC
//!   implementation.
//! - [`ui`]: the native call UI bridge, with a no-op variant for
//!   platforms without one.

pub mod error;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod test_utils;
pub mod types;
pub mod ui;

pub use error::CallError;
pub use negotiation::{
    ConnectionState, EngineError, EngineEvent, MediaEngine, MediaEngineFactory, NegotiationState,
    SdpKind, SignalingPhase, WebRtcEngine, WebRtcEngineConfig, WebRtcEngineFactory,
};
pub use session::{
    ActiveCallSession, CallLog, CallPhase, CallSessionCoordinator, CallTransition,
    CoordinatorConfig, CoordinatorRegistry, InvalidTransition, MemoryCallLog, NoopCallLog,
};
pub use signaling::{
    CallSignal, IceCandidate, InMemoryBroker, IncomingCallPayload, SignalKind, SignalPayload,
    SignalingTransport, TransportError,
};
pub use types::call::{
    AccountId, CallDirection, CallId, CallLogEntry, EndCallReason, MediaKind, RoomId,
};
pub use types::events::{CallEvent, CallEvents};
pub use ui::{NativeCallUi, NativeUiBridge, NativeUiEvent, NoopCallUi};
