//! In-process fan-out of seat changes to live seat-map subscribers.
//!
//! Every subscriber owns a private bounded queue (a single-receiver
//! `tokio::sync::broadcast` channel). Publishing never waits: when a slow
//! subscriber's queue is full the oldest pending change is overwritten and
//! the subscriber later learns how many it missed through
//! [`Delivery::Lagged`]. Clients are expected to notice the version gap and
//! re-fetch the seat map if they care.

use dashmap::DashMap;
use seatmap_shared::{EventId, SeatChange};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Enough to cancel a subscription from anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub event_id: EventId,
    pub id: SubscriptionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Change(SeatChange),
    /// This many changes were dropped because the queue was full.
    Lagged(u64),
}

#[derive(Default)]
struct Registry {
    channels: DashMap<EventId, HashMap<SubscriptionId, broadcast::Sender<SeatChange>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match self.channels.get_mut(&handle.event_id) {
            Some(mut subscribers) => subscribers.remove(&handle.id).is_some(),
            None => false,
        };
        self.channels
            .remove_if(&handle.event_id, |_, subscribers| subscribers.is_empty());
        removed
    }
}

pub struct EventBroadcaster {
    registry: Arc<Registry>,
    queue_capacity: usize,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// `queue_capacity` is per subscriber. The underlying channel rounds it
    /// up to a power of two.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn subscribe(&self, event_id: EventId) -> Subscription {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = broadcast::channel(self.queue_capacity);

        self.registry
            .channels
            .entry(event_id.clone())
            .or_default()
            .insert(id, tx);

        debug!("Subscribed {} to event {}", id, event_id);

        Subscription {
            handle: SubscriptionHandle { event_id, id },
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Returns whether the subscription was still registered. Calling it
    /// again, or after the `Subscription` was dropped, is harmless.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.registry.remove(handle);
        if removed {
            debug!("Unsubscribed {} from event {}", handle.id, handle.event_id);
        }
        removed
    }

    /// Hand `change` to every current subscriber of `event_id`. Returns how
    /// many subscribers it was queued for.
    pub fn publish(&self, event_id: &EventId, change: &SeatChange) -> usize {
        let Some(subscribers) = self.registry.channels.get(event_id) else {
            return 0;
        };

        let mut delivered = 0;
        for tx in subscribers.values() {
            // Only fails when the receiver is already gone; the Drop of the
            // Subscription is about to deregister it.
            if tx.send(change.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, event_id: &EventId) -> usize {
        self.registry
            .channels
            .get(event_id)
            .map_or(0, |subscribers| subscribers.len())
    }

    pub fn total_subscribers(&self) -> usize {
        self.registry
            .channels
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Drop every subscription. Receivers drain what is queued and then see
    /// the end of their stream.
    pub fn close_all(&self) {
        self.registry.channels.clear();
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving side of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    handle: SubscriptionHandle,
    receiver: broadcast::Receiver<SeatChange>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn event_id(&self) -> &EventId {
        &self.handle.event_id
    }

    /// Wait for the next delivery. `None` once the subscription has been
    /// cancelled (or the broadcaster closed) and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.receiver.recv().await {
            Ok(change) => Some(Delivery::Change(change)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(Delivery::Lagged(missed)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-waiting variant of [`Subscription::recv`]; `None` when nothing is
    /// queued right now.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.receiver.try_recv() {
            Ok(change) => Some(Delivery::Change(change)),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Some(Delivery::Lagged(missed)),
            Err(_) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.handle);
        }
    }
}
