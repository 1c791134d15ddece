//! In-Process Broker
//!
//! A broker that lives entirely in memory. It keeps registrations, retained
//! property values and live watches, and optionally logs every publish. With an event
//! sink attached it behaves like a real broker towards the bridge: a
//! property set on a watched topic is delivered back to the watcher, and
//! [`MemoryBroker::write`] plays the part of an external client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Behaviour, Broker, BrokerMessage, RegisterOptions, Subscription, WatchKind};
use crate::event::EventSender;

/// A registered topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub behaviour: Behaviour,
    pub description: String,
    pub options: RegisterOptions,
}

#[derive(Debug, Default)]
struct State {
    registrations: HashMap<String, Registration>,
    properties: HashMap<String, Value>,
    watches: HashMap<(String, WatchKind), usize>,
    /// Publish log, kept only when recording
    published: Option<Vec<(String, Value)>>,
}

/// Broker kept in process memory
pub struct MemoryBroker {
    state: Mutex<State>,
    events: Option<EventSender>,
    next_subscription_id: AtomicU64,
}

impl MemoryBroker {
    /// Create a broker that delivers nothing
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            events: None,
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Create a broker that delivers watched topics to the event queue
    pub fn with_events(events: EventSender) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    /// Keep a log of every `set_property` call
    ///
    /// The log grows without bound; meant for tests and short dry runs.
    pub fn recording(mut self) -> Self {
        self.state.get_mut().published = Some(Vec::new());
        self
    }

    /// Write a value as an external client would
    ///
    /// Properties keep the value. Returns whether anything watched the topic.
    pub fn write(&self, topic: &str, value: Option<Value>) -> bool {
        let watched = {
            let mut state = self.state.lock();
            let is_property = state
                .registrations
                .get(topic)
                .map_or(true, |r| r.behaviour.is_property());
            if is_property {
                match &value {
                    Some(v) => {
                        state.properties.insert(topic.to_string(), v.clone());
                    }
                    None => {
                        state.properties.remove(topic);
                    }
                }
            }
            Self::watch_count(&state, topic) > 0
        };
        if watched {
            self.deliver(topic, value);
        }
        watched
    }

    /// Registration of a topic, if any
    pub fn registration(&self, topic: &str) -> Option<Registration> {
        self.state.lock().registrations.get(topic).cloned()
    }

    /// Whether a topic is registered
    pub fn is_registered(&self, topic: &str) -> bool {
        self.state.lock().registrations.contains_key(topic)
    }

    /// All registered topics, sorted
    pub fn registered_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().registrations.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Latest value of a property
    pub fn property(&self, topic: &str) -> Option<Value> {
        self.state.lock().properties.get(topic).cloned()
    }

    /// Number of live watches on a topic (property and event)
    pub fn watchers(&self, topic: &str) -> usize {
        Self::watch_count(&self.state.lock(), topic)
    }

    /// Total number of live watches
    pub fn total_watchers(&self) -> usize {
        self.state.lock().watches.values().sum()
    }

    /// Every `set_property` call so far, in order; empty unless recording
    pub fn published(&self) -> Vec<(String, Value)> {
        self.state.lock().published.clone().unwrap_or_default()
    }

    /// Values published to one topic, in order; empty unless recording
    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.state
            .lock()
            .published
            .iter()
            .flatten()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Number of `set_property` calls so far; zero unless recording
    pub fn publish_count(&self) -> usize {
        self.state.lock().published.as_ref().map_or(0, Vec::len)
    }

    fn watch_count(state: &State, topic: &str) -> usize {
        [WatchKind::Property, WatchKind::Event]
            .iter()
            .filter_map(|kind| state.watches.get(&(topic.to_string(), *kind)))
            .sum()
    }

    fn deliver(&self, topic: &str, value: Option<Value>) {
        if let Some(ref events) = self.events {
            if events.send(BrokerMessage::new(topic, value).into()).is_err() {
                debug!("Memory broker: event queue closed, dropping {}", topic);
            }
        }
    }

    fn watch(&self, topic: &str, kind: WatchKind) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let retained = {
            let mut state = self.state.lock();
            *state.watches.entry((topic.to_string(), kind)).or_insert(0) += 1;
            match kind {
                WatchKind::Property => state.properties.get(topic).cloned(),
                WatchKind::Event => None,
            }
        };
        // A new property watch sees the retained value, as on MQTT
        if let Some(value) = retained {
            self.deliver(topic, Some(value));
        }
        Subscription::new(id, topic, kind)
    }

    fn unwatch_kind(&self, subscription: Subscription, kind: WatchKind) {
        let mut state = self.state.lock();
        let key = (subscription.topic().to_string(), kind);
        match state.watches.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.watches.remove(&key);
            }
            None => warn!(
                "Memory broker: unwatch of {} without a live watch",
                subscription.topic()
            ),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn register(
        &self,
        topic: &str,
        behaviour: Behaviour,
        description: &str,
        options: RegisterOptions,
    ) {
        debug!("Memory broker: register {} ({})", topic, behaviour);
        self.state.lock().registrations.insert(
            topic.to_string(),
            Registration {
                behaviour,
                description: description.to_string(),
                options,
            },
        );
    }

    fn unregister(&self, topic: &str) {
        debug!("Memory broker: unregister {}", topic);
        let mut state = self.state.lock();
        if let Some(registration) = state.registrations.remove(topic) {
            if registration.options.delete_on_unregister {
                state.properties.remove(topic);
            }
        }
    }

    fn set_property(&self, topic: &str, value: Value) {
        let watched = {
            let mut state = self.state.lock();
            state.properties.insert(topic.to_string(), value.clone());
            if let Some(ref mut published) = state.published {
                published.push((topic.to_string(), value.clone()));
            }
            state
                .watches
                .contains_key(&(topic.to_string(), WatchKind::Property))
        };
        if watched {
            self.deliver(topic, Some(value));
        }
    }

    fn watch_property(&self, topic: &str) -> Subscription {
        self.watch(topic, WatchKind::Property)
    }

    fn unwatch_property(&self, subscription: Subscription) {
        self.unwatch_kind(subscription, WatchKind::Property);
    }

    fn watch_event(&self, topic: &str) -> Subscription {
        self.watch(topic, WatchKind::Event)
    }

    fn unwatch_event(&self, subscription: Subscription) {
        self.unwatch_kind(subscription, WatchKind::Event);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::{self, BridgeEvent};

    #[test]
    fn test_register_and_unregister_deletes_property() {
        let broker = MemoryBroker::new();
        broker.register(
            "a/b",
            Behaviour::PropertyOneToMany,
            "test",
            RegisterOptions::cleanup(),
        );
        broker.set_property("a/b", json!(1));
        assert_eq!(broker.property("a/b"), Some(json!(1)));

        broker.unregister("a/b");
        assert!(!broker.is_registered("a/b"));
        assert_eq!(broker.property("a/b"), None);
    }

    #[test]
    fn test_unregister_keeps_property_without_cleanup() {
        let broker = MemoryBroker::new();
        broker.register(
            "a/b",
            Behaviour::PropertyOneToMany,
            "test",
            RegisterOptions::default(),
        );
        broker.set_property("a/b", json!("x"));
        broker.unregister("a/b");
        assert_eq!(broker.property("a/b"), Some(json!("x")));
    }

    #[test]
    fn test_set_property_echoes_to_watchers() {
        let (tx, mut rx) = event::channel();
        let broker = MemoryBroker::with_events(tx);

        let sub = broker.watch_property("a/b");
        broker.set_property("a/b", json!(true));

        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::Broker(BrokerMessage::new("a/b", Some(json!(true))))
        );

        broker.unwatch_property(sub);
        broker.set_property("a/b", json!(false));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_watch_delivers_retained_value() {
        let (tx, mut rx) = event::channel();
        let broker = MemoryBroker::with_events(tx);
        broker.set_property("a/b", json!(5));

        let _sub = broker.watch_property("a/b");
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::Broker(BrokerMessage::new("a/b", Some(json!(5))))
        );
    }

    #[test]
    fn test_write_without_watchers_is_not_delivered() {
        let (tx, mut rx) = event::channel();
        let broker = MemoryBroker::with_events(tx);
        assert!(!broker.write("a/b", Some(json!(1))));
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.property("a/b"), Some(json!(1)));
    }

    #[test]
    fn test_event_write_is_not_retained() {
        let (tx, mut rx) = event::channel();
        let broker = MemoryBroker::with_events(tx);
        broker.register(
            "a/cmd",
            Behaviour::EventManyToOne,
            "test",
            RegisterOptions::default(),
        );
        let _sub = broker.watch_event("a/cmd");

        assert!(broker.write("a/cmd", None));
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::Broker(BrokerMessage::new("a/cmd", None))
        );
        assert_eq!(broker.property("a/cmd"), None);
    }

    #[test]
    fn test_publish_log_only_when_recording() {
        let broker = MemoryBroker::new();
        broker.set_property("a/b", json!(1));
        assert_eq!(broker.publish_count(), 0);
        assert!(broker.published().is_empty());
        assert_eq!(broker.property("a/b"), Some(json!(1)));

        let broker = MemoryBroker::new().recording();
        broker.set_property("a/b", json!(1));
        broker.set_property("a/c", json!(2));
        broker.set_property("a/b", json!(3));
        assert_eq!(broker.publish_count(), 3);
        assert_eq!(broker.published_to("a/b"), vec![json!(1), json!(3)]);
    }

    #[test]
    fn test_watch_counts() {
        let broker = MemoryBroker::new();
        let first = broker.watch_property("a");
        let second = broker.watch_event("a");
        assert_eq!(broker.watchers("a"), 2);
        assert_eq!(broker.total_watchers(), 2);

        broker.unwatch(first);
        broker.unwatch(second);
        assert_eq!(broker.watchers("a"), 0);
    }
}
