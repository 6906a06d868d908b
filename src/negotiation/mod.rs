//! Media negotiation: the engine capability and the offer/answer guards.

pub mod engine;
pub mod state;
pub mod webrtc;

pub use engine::{
    ConnectionState, EngineError, EngineEvent, MediaEngine, MediaEngineFactory, SdpKind,
};
pub use state::{NegotiationState, SignalingPhase};
pub use webrtc::{WebRtcEngine, WebRtcEngineConfig, WebRtcEngineFactory, default_ice_servers};
