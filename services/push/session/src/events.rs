//! Event notification for push connection observers.
//!
//! Observers attach with [`EventHub::subscribe`] and receive events on their
//! own unbounded channel. A [`Subscription`] detaches itself when dropped, and
//! the connection clears every subscriber on teardown so no observer keeps
//! receiving from a dead connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::PushError;
use crate::notification::PushNotification;

/// Events emitted by a push connection
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// A direct message notification arrived
    MessageReceived(Arc<PushNotification>),
    /// An error was caught while the connection was running
    ExceptionCaught(Arc<PushError>),
}

type SubscriberMap = Mutex<HashMap<u64, mpsc::UnboundedSender<PushEvent>>>;

fn lock(map: &SubscriberMap) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<PushEvent>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fan-out of connection events to subscribers
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    subscribers: Arc<SubscriberMap>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).insert(id, tx);
        debug!("Event subscriber {} attached", id);
        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deliver an event to every subscriber
    pub fn emit(&self, event: PushEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|id, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                trace!("Dropping closed event subscriber {}", id);
            }
            delivered
        });
    }

    /// Detach every subscriber; their receivers observe end of stream
    pub fn clear(&self) {
        let mut subscribers = lock(&self.subscribers);
        if !subscribers.is_empty() {
            debug!("Detaching {} event subscribers", subscribers.len());
        }
        subscribers.clear();
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Receiving end of a subscription; detaches on drop
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<PushEvent>,
    hub: Weak<SubscriberMap>,
}

impl Subscription {
    /// Next event, or `None` once the hub detached this subscriber
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.hub.upgrade() {
            lock(&subscribers).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PushError, RegistrationError};

    #[tokio::test]
    async fn test_fan_out_and_detach() {
        let hub = EventHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.emit(PushEvent::ExceptionCaught(Arc::new(PushError::Registration(
            RegistrationError::InvalidToken("{}".to_string()),
        ))));
        assert!(matches!(first.recv().await, Some(PushEvent::ExceptionCaught(_))));
        assert!(matches!(second.recv().await, Some(PushEvent::ExceptionCaught(_))));

        drop(second);
        assert_eq!(hub.subscriber_count(), 1);

        hub.clear();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(first.recv().await.is_none());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let hub = EventHub::new();
        hub.emit(PushEvent::MessageReceived(Arc::new(PushNotification::default())));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
