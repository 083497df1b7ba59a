//! Companion publish/subscribe event bus.
//!
//! The HTTP/SSE layer consumes this: it publishes its own events, subscribes
//! with a [`BusFilter`], and replays recent events from the ring buffer with
//! [`EventBus::history`].

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use statesync_core::config::DEFAULT_BUS_CAPACITY;
use statesync_core::ChangeRecord;

use crate::fanout::SubscriptionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub data: Value,
    pub level: EventLevel,
}

/// Every populated field must match; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusFilter {
    pub types: Option<Vec<String>>,
    pub session_id: Option<String>,
    pub min_level: Option<EventLevel>,
}

impl BusFilter {
    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: Some(types.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_min_level(mut self, level: EventLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if event.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        match self.min_level {
            Some(min) => event.level >= min,
            None => true,
        }
    }
}

type BusCallback = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct BusSubscriber {
    id: SubscriptionId,
    filter: BusFilter,
    callback: BusCallback,
}

pub struct EventBus {
    capacity: usize,
    buffer: Mutex<VecDeque<BusEvent>>,
    subscribers: RwLock<Vec<BusSubscriber>>,
    stream: broadcast::Sender<BusEvent>,
    next_event: AtomicU64,
    next_subscriber: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (stream, _) = broadcast::channel(capacity);
        Self {
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            subscribers: RwLock::new(Vec::new()),
            stream,
            next_event: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn publish(
        &self,
        event_type: impl Into<String>,
        session_id: Option<String>,
        data: Value,
    ) -> BusEvent {
        self.publish_with_level(event_type, session_id, data, EventLevel::Info)
    }

    pub fn publish_with_level(
        &self,
        event_type: impl Into<String>,
        session_id: Option<String>,
        data: Value,
        level: EventLevel,
    ) -> BusEvent {
        let seq = self.next_event.fetch_add(1, Ordering::Relaxed);
        let event = BusEvent {
            id: format!("evt-{seq}"),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            session_id,
            data,
            level,
        };

        {
            let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        let targets: Vec<(SubscriptionId, BusCallback)> = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| (s.id, s.callback.clone()))
            .collect();
        for (id, callback) in targets {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                tracing::warn!(subscription = id.0, event = %event.event_type, "bus subscriber panicked");
            }
        }

        // No live receivers is the normal case outside SSE.
        let _ = self.stream.send(event.clone());
        event
    }

    /// Normalized bus form of a store change: type `state.<changeType>`,
    /// session parsed from the document path, the change record as data.
    pub fn publish_change(&self, change: &ChangeRecord) -> Result<BusEvent, serde_json::Error> {
        let data = serde_json::to_value(change)?;
        Ok(self.publish(
            format!("state.{}", change.operation),
            change.document_path.session_id().map(str::to_owned),
            data,
        ))
    }

    pub fn subscribe<F>(&self, filter: BusFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(BusSubscriber {
                id,
                filter,
                callback: Arc::new(callback),
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// The most recent `limit` matching events, oldest first.
    pub fn history(&self, filter: &BusFilter, limit: usize) -> Vec<BusEvent> {
        let buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        let mut matched: Vec<BusEvent> = buffer
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Live feed of every published event, for streaming consumers.
    pub fn stream(&self) -> broadcast::Receiver<BusEvent> {
        self.stream.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statesync_core::{ChangeOperation, DocumentPath, WriterId};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_returns_event_with_fields() {
        let bus = EventBus::default();
        let event = bus.publish("task.started", Some("s1".into()), json!({"task": 3}));
        assert_eq!(event.event_type, "task.started");
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert_eq!(event.level, EventLevel::Info);
        assert!(event.id.starts_with("evt-"));

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], json!("task.started"));
        assert_eq!(wire["sessionId"], json!("s1"));
    }

    #[test]
    fn ring_buffer_keeps_most_recent() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.publish("tick", None, json!(n));
        }
        let events = bus.history(&BusFilter::default(), 10);
        let data: Vec<Value> = events.into_iter().map(|e| e.data).collect();
        assert_eq!(data, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn history_applies_filter_and_limit() {
        let bus = EventBus::default();
        bus.publish("a", Some("s1".into()), json!(1));
        bus.publish("b", Some("s1".into()), json!(2));
        bus.publish("a", Some("s2".into()), json!(3));
        bus.publish("a", Some("s1".into()), json!(4));

        let filter = BusFilter {
            types: Some(vec!["a".into()]),
            session_id: Some("s1".into()),
            min_level: None,
        };
        let all: Vec<Value> = bus.history(&filter, 10).into_iter().map(|e| e.data).collect();
        assert_eq!(all, vec![json!(1), json!(4)]);
        let last: Vec<Value> = bus.history(&filter, 1).into_iter().map(|e| e.data).collect();
        assert_eq!(last, vec![json!(4)]);
    }

    #[test]
    fn subscribers_receive_only_matching_levels() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(BusFilter::default().with_min_level(EventLevel::Warn), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_with_level("x", None, json!(null), EventLevel::Debug);
        bus.publish("x", None, json!(null));
        bus.publish_with_level("x", None, json!(null), EventLevel::Error);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe(BusFilter::types(["x"]), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish("x", None, json!(1));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish("x", None, json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn change_records_are_normalized() {
        let bus = EventBus::default();
        let change = ChangeRecord::new(
            DocumentPath::new("sessions/abc/tasks").unwrap(),
            None,
            json!({"queued": 1}),
            ChangeOperation::Create,
            WriterId::from("api"),
        );
        let event = bus.publish_change(&change).unwrap();
        assert_eq!(event.event_type, "state.create");
        assert_eq!(event.session_id.as_deref(), Some("abc"));
        assert_eq!(event.data["filePath"], json!("sessions/abc/tasks"));
        assert_eq!(event.data["newValue"], json!({"queued": 1}));
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.stream();
        bus.publish("hello", None, json!("world"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "hello");
    }
}
