//! Broker Interface
//!
//! The bridge exposes device state through a Qth-style broker: every topic
//! is registered with a [`Behaviour`] and a description, properties hold
//! their latest value, events are discrete occurrences.
//!
//! All [`Broker`] calls are fire-and-forget. Implementations queue the
//! request and return immediately; transport failures are logged by the
//! implementation and never reach the bridge.
//!
//! Deliveries on watched topics arrive as [`BrokerMessage`] values on the
//! bridge event queue.

use std::fmt;

use serde_json::Value;

pub mod memory;
pub mod qth;

pub use memory::MemoryBroker;
pub use qth::QthClient;

/// Topic behaviour as understood by the broker registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Behaviour {
    /// One writer, many readers
    PropertyOneToMany,
    /// Many writers, one reader
    PropertyManyToOne,
    /// One sender, many listeners
    EventOneToMany,
    /// Many senders, one listener
    EventManyToOne,
}

impl Behaviour {
    /// Registrar string for this behaviour
    pub fn as_str(&self) -> &'static str {
        match self {
            Behaviour::PropertyOneToMany => "PROPERTY-1:N",
            Behaviour::PropertyManyToOne => "PROPERTY-N:1",
            Behaviour::EventOneToMany => "EVENT-1:N",
            Behaviour::EventManyToOne => "EVENT-N:1",
        }
    }

    /// Whether topics with this behaviour keep a latest value
    pub fn is_property(&self) -> bool {
        matches!(
            self,
            Behaviour::PropertyOneToMany | Behaviour::PropertyManyToOne
        )
    }
}

impl fmt::Display for Behaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterOptions {
    /// Delete the property when the registration goes away, including when
    /// the connection drops without a clean shutdown
    pub delete_on_unregister: bool,
}

impl RegisterOptions {
    /// Options for topics that must not outlive the bridge
    pub fn cleanup() -> Self {
        Self {
            delete_on_unregister: true,
        }
    }
}

/// Kind of a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Property,
    Event,
}

/// Handle of a live watch
///
/// Returned by [`Broker::watch_property`] and [`Broker::watch_event`] and
/// consumed by the matching unwatch call, so a handle is disposed at most
/// once.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    topic: String,
    kind: WatchKind,
}

impl Subscription {
    pub fn new(id: u64, topic: impl Into<String>, kind: WatchKind) -> Self {
        Self {
            id,
            topic: topic.into(),
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    /// Whether a delivery on `topic` belongs to this watch
    pub fn matches(&self, topic: &str) -> bool {
        self.topic == topic
    }
}

/// A value delivered on a watched topic
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    /// `None` for an empty payload (deleted property or bare event)
    pub value: Option<Value>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            topic: topic.into(),
            value,
        }
    }
}

/// Broker client as seen by the bridge
pub trait Broker: Send + Sync {
    /// Register a topic with the registrar
    fn register(
        &self,
        topic: &str,
        behaviour: Behaviour,
        description: &str,
        options: RegisterOptions,
    );

    /// Drop a topic registration
    fn unregister(&self, topic: &str);

    /// Set the latest value of a property
    fn set_property(&self, topic: &str, value: Value);

    /// Start receiving values written to a property
    fn watch_property(&self, topic: &str) -> Subscription;

    fn unwatch_property(&self, subscription: Subscription);

    /// Start receiving events sent on a topic
    fn watch_event(&self, topic: &str) -> Subscription;

    fn unwatch_event(&self, subscription: Subscription);

    /// Dispose of a handle with the matching unwatch call
    fn unwatch(&self, subscription: Subscription) {
        match subscription.kind() {
            WatchKind::Property => self.unwatch_property(subscription),
            WatchKind::Event => self.unwatch_event(subscription),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behaviour_strings() {
        assert_eq!(Behaviour::PropertyOneToMany.as_str(), "PROPERTY-1:N");
        assert_eq!(Behaviour::PropertyManyToOne.as_str(), "PROPERTY-N:1");
        assert_eq!(Behaviour::EventOneToMany.as_str(), "EVENT-1:N");
        assert_eq!(Behaviour::EventManyToOne.as_str(), "EVENT-N:1");

        assert!(Behaviour::PropertyManyToOne.is_property());
        assert!(!Behaviour::EventManyToOne.is_property());
    }

    #[test]
    fn test_subscription_matches_exact_topic() {
        let sub = Subscription::new(1, "sys/zwave/state", WatchKind::Property);
        assert!(sub.matches("sys/zwave/state"));
        assert!(!sub.matches("sys/zwave/state/extra"));
        assert!(!sub.matches("sys/zwave"));
    }
}
