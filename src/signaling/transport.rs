//! The pub/sub signaling transport capability.
//!
//! Two channel kinds exist: a per-account inbox (out-of-call signals such
//! as `call-request`) and a per-call room shared by exactly the two
//! participants. Delivery is at-most-once with no ordering guarantee
//! between channels; signals on one subscription are handed out
//! sequentially in delivery order.
//!
//! A subscribe or send may fail or hang: callers must bound their wait and
//! treat "no result" as unknown, not as not-delivered.

use crate::signaling::message::CallSignal;
use crate::types::call::{AccountId, RoomId};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport operation timed out")]
    Timeout,

    #[error("channel closed")]
    Closed,
}

/// Address of a single pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelAddr {
    Inbox(AccountId),
    Room(RoomId),
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox(account) => write!(f, "inbox:{}", account),
            Self::Room(room) => f.write_str(room.as_str()),
        }
    }
}

/// Opaque handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) channel: ChannelAddr,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &ChannelAddr {
        &self.channel
    }
}

/// An active subscription: the handle plus the signal receiver.
///
/// Consuming the receiver sequentially is what gives per-subscription
/// ordered, non-concurrent dispatch.
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub signals: mpsc::Receiver<CallSignal>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Best-effort pub/sub transport for call signaling.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Publish a signal to an account's inbox channel.
    async fn send_to_inbox(
        &self,
        account: &AccountId,
        signal: CallSignal,
    ) -> Result<(), TransportError>;

    /// Publish a signal to a call room channel.
    async fn send_to_room(&self, room: &RoomId, signal: CallSignal) -> Result<(), TransportError>;

    /// Subscribe to an account's inbox channel.
    async fn subscribe_inbox(&self, account: &AccountId) -> Result<Subscription, TransportError>;

    /// Subscribe to a call room channel.
    async fn subscribe_room(&self, room: &RoomId) -> Result<Subscription, TransportError>;

    /// Tear down a subscription. Unknown handles are a no-op.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError>;
}
