//! Node Bridge

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{PendingEchoes, ValueBridge};
use crate::broker::{Behaviour, Broker, BrokerMessage, RegisterOptions, Subscription};
use crate::device::{Controller, DeviceError, Node, NodeId, ValueId, ValueUpdate};
use crate::topic::{NodeTopics, Topics};

/// Literal payload that confirms a forced removal
pub const REMOVE_COMMAND: &str = "remove";

/// Registrations of a node that finished its interview
struct Active {
    refresh: Subscription,
    remove: Subscription,
    values: Vec<ValueBridge>,
}

/// One node mirrored to `<prefix>nodes/<id>/`
///
/// Nothing is registered until the node is ready.
pub struct NodeBridge {
    node: Arc<dyn Node>,
    topics: NodeTopics,
    active: Option<Active>,
}

impl NodeBridge {
    /// Track a node; registers right away if the node is already ready
    pub fn new(broker: &dyn Broker, topics: &Topics, node: Arc<dyn Node>) -> Self {
        let mut bridge = Self {
            topics: topics.node(node.id()),
            node,
            active: None,
        };
        if bridge.node.is_ready() {
            bridge.activate(broker);
        }
        bridge
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn topics(&self) -> &NodeTopics {
        &self.topics
    }

    /// Whether the node's topics are registered
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Bridged values, in creation order
    pub fn values(&self) -> &[ValueBridge] {
        match self.active {
            Some(ref active) => &active.values,
            None => &[],
        }
    }

    /// Bridge of one value
    pub fn value(&self, value_id: &ValueId) -> Option<&ValueBridge> {
        self.values().iter().find(|v| v.value_id() == value_id)
    }

    /// The node finished its interview
    pub fn handle_ready(&mut self, broker: &dyn Broker) {
        if self.active.is_some() {
            debug!("Node {}: already bridged, ignoring ready", self.id());
            return;
        }
        self.activate(broker);
    }

    /// A value on the node changed
    pub fn handle_value_updated(&mut self, broker: &dyn Broker, update: &ValueUpdate) {
        if let Some(ref mut active) = self.active {
            for value in active
                .values
                .iter_mut()
                .filter(|v| v.value_id() == &update.value_id)
            {
                value.handle_device_update(broker, update);
            }
        }
    }

    /// The node started defining a value
    ///
    /// A value already bridged under the same identity is replaced; its
    /// in-flight broker echoes are returned.
    pub fn handle_value_added(
        &mut self,
        broker: &dyn Broker,
        value_id: ValueId,
    ) -> Option<PendingEchoes> {
        let Some(ref mut active) = self.active else {
            return None;
        };
        let pending = active
            .values
            .iter()
            .position(|v| v.value_id() == &value_id)
            .and_then(|index| active.values.remove(index).teardown(broker));
        if let Some(value) = ValueBridge::new(broker, &self.topics, self.node.clone(), value_id) {
            active.values.push(value);
        }
        pending
    }

    /// The node no longer defines a value
    pub fn handle_value_removed(
        &mut self,
        broker: &dyn Broker,
        value_id: &ValueId,
    ) -> Option<PendingEchoes> {
        let active = self.active.as_mut()?;
        let index = active.values.iter().position(|v| v.value_id() == value_id)?;
        debug!("Node {}: value {} removed", self.node.id(), value_id);
        active.values.remove(index).teardown(broker)
    }

    /// A value arrived on one of the node's topics
    ///
    /// Only device write failures are returned.
    pub fn handle_message(
        &mut self,
        controller: &dyn Controller,
        message: &BrokerMessage,
    ) -> Result<(), DeviceError> {
        let Some(ref mut active) = self.active else {
            return Ok(());
        };

        if active.refresh.matches(&message.topic) {
            info!("Node {}: refreshing values", self.node.id());
            self.node.refresh_values();
            return Ok(());
        }

        if active.remove.matches(&message.topic) {
            match message.value {
                Some(Value::String(ref command)) if command == REMOVE_COMMAND => {
                    info!("Node {}: removing failed node", self.node.id());
                    if let Err(e) = controller.remove_failed_node(self.node.id()) {
                        warn!("Node {}: failed to remove: {}", self.node.id(), e);
                    }
                }
                ref other => debug!(
                    "Node {}: ignoring removal command {:?}",
                    self.node.id(),
                    other
                ),
            }
            return Ok(());
        }

        for value in active
            .values
            .iter_mut()
            .filter(|v| v.topic() == message.topic)
        {
            value.handle_broker_write(message.value.as_ref())?;
        }
        Ok(())
    }

    /// Unregister everything the node registered
    ///
    /// Returns the broker echoes of its values that are still in flight.
    pub fn teardown(self, broker: &dyn Broker) -> Vec<PendingEchoes> {
        let Some(active) = self.active else {
            return Vec::new();
        };

        broker.unregister(&self.topics.manufacturer_name());
        broker.unregister(&self.topics.description());
        broker.unregister(&self.topics.neighbors());
        broker.unregister(&self.topics.refresh_values());
        broker.unregister(&self.topics.remove_failed_node());

        broker.unwatch(active.refresh);
        broker.unwatch(active.remove);

        let pending: Vec<PendingEchoes> = active
            .values
            .into_iter()
            .filter_map(|value| value.teardown(broker))
            .collect();
        debug!("Node {}: unbridged", self.node.id());
        pending
    }

    fn activate(&mut self, broker: &dyn Broker) {
        let config = self.node.device_config();

        let attributes = [
            (
                self.topics.manufacturer_name(),
                "Device manufacturer's name",
                config.as_ref().map(|c| c.manufacturer.clone()),
            ),
            (
                self.topics.description(),
                "Device description",
                config.as_ref().map(|c| c.description.clone()),
            ),
        ];
        for (topic, description, value) in attributes {
            broker.register(
                &topic,
                Behaviour::PropertyOneToMany,
                description,
                RegisterOptions::cleanup(),
            );
            broker.set_property(&topic, value.map_or(Value::Null, Value::String));
        }

        let neighbors = self.topics.neighbors();
        broker.register(
            &neighbors,
            Behaviour::PropertyOneToMany,
            "Neighbouring node IDs",
            RegisterOptions::cleanup(),
        );
        broker.set_property(&neighbors, json!(self.node.neighbors()));

        let refresh_topic = self.topics.refresh_values();
        broker.register(
            &refresh_topic,
            Behaviour::EventManyToOne,
            "Trigger a poll of all this node's values",
            RegisterOptions::cleanup(),
        );
        let refresh = broker.watch_event(&refresh_topic);

        let remove_topic = self.topics.remove_failed_node();
        broker.register(
            &remove_topic,
            Behaviour::EventManyToOne,
            "Send the string 'remove' to forcibly remove this node from the controller.",
            RegisterOptions::cleanup(),
        );
        let remove = broker.watch_event(&remove_topic);

        let values: Vec<ValueBridge> = self
            .node
            .defined_value_ids()
            .into_iter()
            .filter_map(|value_id| {
                ValueBridge::new(broker, &self.topics, self.node.clone(), value_id)
            })
            .collect();

        info!(
            "Node {}: bridged with {} values at {}",
            self.node.id(),
            values.len(),
            self.topics.prefix()
        );

        self.active = Some(Active {
            refresh,
            remove,
            values,
        });
    }
}
