//! Change fan-out.
//!
//! [`Fanout::broadcast`] runs once per accepted mutation and delivers, in
//! order, to:
//! 1. unfiltered subscribers
//! 2. filtered subscribers whose [`ChangeFilter`] matches
//! 3. the [`EventBus`]
//! 4. every registered [`NotificationChannel`]
//!
//! Target lists are snapshotted before delivery, so a callback may subscribe
//! or unsubscribe without deadlocking.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use statesync_core::{ChangeOperation, ChangeRecord, DocumentPath};

use crate::bus::EventBus;
use crate::channel::NotificationChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Restricts a subscription by document path and/or operation. `None`
/// means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub paths: Option<HashSet<DocumentPath>>,
    pub operations: Option<HashSet<ChangeOperation>>,
}

impl ChangeFilter {
    pub fn paths(paths: impl IntoIterator<Item = DocumentPath>) -> Self {
        Self {
            paths: Some(paths.into_iter().collect()),
            operations: None,
        }
    }

    pub fn operations(operations: impl IntoIterator<Item = ChangeOperation>) -> Self {
        Self {
            paths: None,
            operations: Some(operations.into_iter().collect()),
        }
    }

    pub fn with_operations(mut self, operations: impl IntoIterator<Item = ChangeOperation>) -> Self {
        self.operations = Some(operations.into_iter().collect());
        self
    }

    pub fn matches(&self, change: &ChangeRecord) -> bool {
        let path_ok = self
            .paths
            .as_ref()
            .map_or(true, |paths| paths.contains(&change.document_path));
        let op_ok = self
            .operations
            .as_ref()
            .map_or(true, |ops| ops.contains(&change.operation));
        path_ok && op_ok
    }
}

type ChangeCallback = Arc<dyn Fn(&ChangeRecord) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Option<ChangeFilter>,
    callback: ChangeCallback,
}

pub struct Fanout {
    bus: Arc<EventBus>,
    subscribers: RwLock<Vec<Subscriber>>,
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    next_id: AtomicU64,
}

impl Fanout {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            subscribers: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    pub fn subscribe_filtered<F>(&self, filter: ChangeFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        self.insert(Some(filter), Arc::new(callback))
    }

    fn insert(&self, filter: Option<ChangeFilter>, callback: ChangeCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber {
                id,
                filter,
                callback,
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn add_channel(&self, channel: Arc<dyn NotificationChannel>) {
        tracing::debug!(channel = channel.name(), "notification channel registered");
        self.channels
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(channel);
    }

    /// Deliver `change` to every target. Failures are logged per target and
    /// never propagate to the caller.
    pub fn broadcast(&self, change: &ChangeRecord) {
        let (unfiltered, filtered) = {
            let subscribers = self.subscribers.read().unwrap_or_else(|p| p.into_inner());
            let mut unfiltered = Vec::new();
            let mut filtered = Vec::new();
            for s in subscribers.iter() {
                match &s.filter {
                    None => unfiltered.push((s.id, s.callback.clone())),
                    Some(filter) if filter.matches(change) => {
                        filtered.push((s.id, s.callback.clone()))
                    }
                    Some(_) => {}
                }
            }
            (unfiltered, filtered)
        };

        for (id, callback) in unfiltered.into_iter().chain(filtered) {
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                tracing::warn!(
                    subscription = id.0,
                    path = %change.document_path,
                    "change subscriber panicked",
                );
            }
        }

        if let Err(err) = self.bus.publish_change(change) {
            tracing::warn!(path = %change.document_path, error = %err, "event bus publish failed");
        }

        let channels: Vec<Arc<dyn NotificationChannel>> = self
            .channels
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for channel in channels {
            if let Err(err) = channel.notify(change) {
                tracing::warn!(
                    channel = channel.name(),
                    path = %change.document_path,
                    error = %err,
                    "notification channel failed",
                );
            }
        }
    }

    /// Close and drop every channel. Subscribers stay registered.
    pub fn close(&self) {
        let channels: Vec<Arc<dyn NotificationChannel>> = std::mem::take(
            &mut *self.channels.write().unwrap_or_else(|p| p.into_inner()),
        );
        for channel in channels {
            if let Err(err) = channel.close() {
                tracing::warn!(channel = channel.name(), error = %err, "channel close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFilter;
    use crate::channel::MemoryChannel;
    use crate::error::ChannelError;
    use serde_json::json;
    use statesync_core::WriterId;
    use std::sync::Mutex;

    fn change(path: &str, operation: ChangeOperation) -> ChangeRecord {
        ChangeRecord::new(
            DocumentPath::new(path).unwrap(),
            None,
            json!({"v": 1}),
            operation,
            WriterId::from("test"),
        )
    }

    struct FailingChannel;

    impl NotificationChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }

        fn notify(&self, _change: &ChangeRecord) -> Result<(), ChannelError> {
            Err(ChannelError::Closed("failing".into()))
        }

        fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[test]
    fn delivery_order_is_unfiltered_filtered_bus_channels() {
        let bus = Arc::new(EventBus::default());
        let fanout = Fanout::new(bus.clone());
        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let l = log.clone();
        fanout.subscribe_filtered(ChangeFilter::default(), move |_| {
            l.lock().unwrap().push("filtered".into())
        });
        let l = log.clone();
        fanout.subscribe(move |_| l.lock().unwrap().push("unfiltered".into()));
        let l = log.clone();
        bus.subscribe(BusFilter::default(), move |_| l.lock().unwrap().push("bus".into()));

        let channel = Arc::new(MemoryChannel::new());
        fanout.add_channel(channel.clone());

        fanout.broadcast(&change("queue", ChangeOperation::Update));

        assert_eq!(*log.lock().unwrap(), vec!["unfiltered", "filtered", "bus"]);
        assert_eq!(channel.received().len(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let fanout = Fanout::new(Arc::new(EventBus::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        fanout.subscribe(|_| panic!("subscriber bug"));
        let s = seen.clone();
        fanout.subscribe(move |c: &ChangeRecord| s.lock().unwrap().push(c.clone()));

        let record = change("sessions/a/tasks", ChangeOperation::Create);
        fanout.broadcast(&record);
        assert_eq!(*seen.lock().unwrap(), vec![record]);
    }

    #[test]
    fn failing_channel_does_not_block_later_channels() {
        let fanout = Fanout::new(Arc::new(EventBus::default()));
        let memory = Arc::new(MemoryChannel::new());
        fanout.add_channel(Arc::new(FailingChannel));
        fanout.add_channel(memory.clone());

        fanout.broadcast(&change("queue", ChangeOperation::Delete));
        assert_eq!(memory.received().len(), 1);
    }

    #[test]
    fn filters_match_paths_and_operations() {
        let fanout = Fanout::new(Arc::new(EventBus::default()));
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = hits.clone();
        let filter = ChangeFilter::paths([DocumentPath::new("queue").unwrap()])
            .with_operations([ChangeOperation::Delete]);
        fanout.subscribe_filtered(filter, move |c: &ChangeRecord| {
            h.lock().unwrap().push(c.operation)
        });

        fanout.broadcast(&change("queue", ChangeOperation::Update));
        fanout.broadcast(&change("other", ChangeOperation::Delete));
        fanout.broadcast(&change("queue", ChangeOperation::Delete));
        assert_eq!(*hits.lock().unwrap(), vec![ChangeOperation::Delete]);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself_during_delivery() {
        let fanout = Arc::new(Fanout::new(Arc::new(EventBus::default())));
        let slot = Arc::new(Mutex::new(None::<SubscriptionId>));

        let f = fanout.clone();
        let s = slot.clone();
        let id = fanout.subscribe(move |_| {
            if let Some(id) = s.lock().unwrap().take() {
                f.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        fanout.broadcast(&change("queue", ChangeOperation::Update));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn close_closes_and_drops_channels() {
        let fanout = Fanout::new(Arc::new(EventBus::default()));
        let memory = Arc::new(MemoryChannel::new());
        fanout.add_channel(memory.clone());
        fanout.close();
        assert!(memory.is_closed());

        fanout.broadcast(&change("queue", ChangeOperation::Update));
        assert!(memory.received().is_empty());
    }
}
