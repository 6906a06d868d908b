//! In-process signaling broker.
//!
//! Reference implementation of [`SignalingTransport`] backed by in-memory
//! channels. Used by the test suite and by single-process deployments;
//! production transports implement the same trait over a real pub/sub
//! service.

use crate::signaling::message::CallSignal;
use crate::signaling::transport::{
    ChannelAddr, SignalingTransport, Subscription, SubscriptionHandle, TransportError,
};
use crate::types::call::{AccountId, RoomId};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Per-subscription buffer. A subscriber that falls further behind than
/// this loses signals, matching the transport's at-most-once contract.
const SIGNAL_BUFFER: usize = 64;

/// In-memory pub/sub broker keyed by channel address.
pub struct InMemoryBroker {
    channels: DashMap<ChannelAddr, Vec<(u64, mpsc::Sender<CallSignal>)>>,
    next_id: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn subscribe(&self, channel: ChannelAddr) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        self.channels
            .entry(channel.clone())
            .or_default()
            .push((id, tx));
        Subscription {
            handle: SubscriptionHandle { id, channel },
            signals: rx,
        }
    }

    fn deliver(&self, channel: &ChannelAddr, signal: CallSignal) {
        let Some(mut subscribers) = self.channels.get_mut(channel) else {
            debug!("no subscribers on {}, dropping {}", channel, signal.kind);
            return;
        };
        subscribers.retain(|(id, tx)| {
            if tx.is_closed() {
                debug!("pruning dead subscription {} on {}", id, channel);
                return false;
            }
            // try_send keeps delivery best-effort: a full buffer means the
            // signal is lost, never redelivered.
            if tx.try_send(signal.clone()).is_err() {
                debug!("subscriber {} on {} lagging, dropped {}", id, channel, signal.kind);
            }
            true
        });
    }
}

#[async_trait]
impl SignalingTransport for InMemoryBroker {
    async fn send_to_inbox(
        &self,
        account: &AccountId,
        signal: CallSignal,
    ) -> Result<(), TransportError> {
        self.deliver(&ChannelAddr::Inbox(account.clone()), signal);
        Ok(())
    }

    async fn send_to_room(&self, room: &RoomId, signal: CallSignal) -> Result<(), TransportError> {
        self.deliver(&ChannelAddr::Room(room.clone()), signal);
        Ok(())
    }

    async fn subscribe_inbox(&self, account: &AccountId) -> Result<Subscription, TransportError> {
        Ok(self.subscribe(ChannelAddr::Inbox(account.clone())))
    }

    async fn subscribe_room(&self, room: &RoomId) -> Result<Subscription, TransportError> {
        Ok(self.subscribe(ChannelAddr::Room(room.clone())))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        if let Some(mut subscribers) = self.channels.get_mut(&handle.channel) {
            subscribers.retain(|(id, _)| *id != handle.id);
        }
        Ok(())
    }
}
