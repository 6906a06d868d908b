//! Signaling layer: wire records and the pub/sub transport capability.

pub mod memory;
pub mod message;
pub mod transport;

pub use memory::InMemoryBroker;
pub use message::{CallSignal, IceCandidate, IncomingCallPayload, SignalKind, SignalPayload};
pub use transport::{
    ChannelAddr, SignalingTransport, Subscription, SubscriptionHandle, TransportError,
};
