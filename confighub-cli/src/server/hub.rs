use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use confighub_lib::ChangeEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::metrics::metrics;

struct Subscriber {
    caller_id: String,
    documents: HashSet<u64>,
    tx: mpsc::Sender<ChangeEvent>,
}

/// In-process fan-out of change events to waiting watchers.
///
/// Delivery is at-most-once and best-effort: each subscriber has a queue of
/// one, `publish` never blocks, and a full or closed queue is skipped.
/// Watchers treat an event only as a hint to re-resolve.
pub struct NotificationHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

/// A live registration. Dropping it unsubscribes, which is how a
/// disconnected long poll cleans up after itself.
pub struct Subscription {
    id: u64,
    hub: Arc<NotificationHub>,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in a set of documents.
    pub fn subscribe(
        self: &Arc<Self>,
        caller_id: &str,
        documents: impl IntoIterator<Item = u64>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        let subscriber = Subscriber {
            caller_id: caller_id.to_string(),
            documents: documents.into_iter().collect(),
            tx,
        };
        self.table().insert(id, subscriber);
        Subscription {
            id,
            hub: Arc::clone(self),
            rx,
        }
    }

    /// Remove a subscription. Returns whether anything was removed; calling
    /// it twice is harmless.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.table().remove(&id).is_some()
    }

    /// Hand `event` to every subscriber interested in its document and
    /// return how many accepted it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        metrics()
            .hub_publishes
            .with_label_values(&[event.change_type.as_str()])
            .inc();

        let table = self.table();
        let mut delivered = 0;
        for (id, subscriber) in table.iter() {
            if !subscriber.documents.contains(&event.document_id) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    metrics().hub_dropped.inc();
                    debug!(
                        subscription = id,
                        caller = %subscriber.caller_id,
                        document = event.document_id,
                        "notification dropped"
                    );
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.table().len()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use confighub_lib::ChangeType;

    use super::*;

    fn event(document_id: u64, version: u64) -> ChangeEvent {
        ChangeEvent {
            document_id,
            version,
            change_type: ChangeType::Update,
        }
    }

    #[tokio::test]
    async fn delivers_only_to_interested_subscribers() {
        let hub = Arc::new(NotificationHub::new());
        let mut a = hub.subscribe("a", [1]);
        let mut b = hub.subscribe("b", [2, 3]);

        assert_eq!(hub.publish(event(1, 2)), 1);
        assert_eq!(a.recv().await, Some(event(1, 2)));

        assert_eq!(hub.publish(event(3, 7)), 1);
        assert_eq!(b.recv().await, Some(event(3, 7)));

        assert_eq!(hub.publish(event(9, 1)), 0);
    }

    #[tokio::test]
    async fn full_queue_is_skipped() {
        let hub = Arc::new(NotificationHub::new());
        let mut sub = hub.subscribe("a", [1]);

        assert_eq!(hub.publish(event(1, 2)), 1);
        assert_eq!(hub.publish(event(1, 3)), 0);

        assert_eq!(sub.recv().await, Some(event(1, 2)));
        assert_eq!(hub.publish(event(1, 4)), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let hub = Arc::new(NotificationHub::new());
        let sub = hub.subscribe("a", [1]);
        let id = sub.id();
        assert_eq!(hub.subscriber_count(), 1);

        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(event(1, 2)), 0);
        assert!(!hub.unsubscribe(id));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = Arc::new(NotificationHub::new());
        let sub = hub.subscribe("a", [1]);
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
