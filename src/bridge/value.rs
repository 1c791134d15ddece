//! Value Bridge

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::ExpectedValues;
use crate::broker::{Behaviour, Broker, RegisterOptions, Subscription};
use crate::device::{DeviceError, Node, ValueId, ValueMetadata, ValueUpdate};
use crate::topic::NodeTopics;

fn describe(value_id: &ValueId, metadata: &ValueMetadata) -> String {
    let property_key = value_id
        .property_key
        .as_ref()
        .map_or_else(|| "none".to_string(), |k| k.to_string());
    let metadata_json = serde_json::to_string(metadata).unwrap_or_default();
    format!(
        "Zwave '{}' value. Command class {} ({}), endpoint {}, property {} ({}), \
         property key {} ({}). Metadata: {}",
        metadata.label,
        value_id.command_class,
        metadata.command_class_name,
        value_id.endpoint,
        value_id.property,
        metadata.property_name.as_deref().unwrap_or("none"),
        property_key,
        metadata.property_key_name.as_deref().unwrap_or("none"),
        metadata_json,
    )
}

/// Broker echoes still in flight when a value bridge went away
#[derive(Debug)]
pub struct PendingEchoes {
    pub topic: String,
    pub values: ExpectedValues,
}

/// One device value mirrored to a value topic and a metadata topic
///
/// Readable values become a `PROPERTY-1:N` seeded with the current value;
/// other values become an `EVENT-N:1` channel. Writeable values watch their
/// topic and forward writes to the device.
///
/// Echoes are tracked per direction: values written to the device are only
/// consumed by device updates, values published to the broker only by
/// broker deliveries.
pub struct ValueBridge {
    node: Arc<dyn Node>,
    value_id: ValueId,
    metadata: ValueMetadata,
    topic: String,
    metadata_topic: String,
    device_echoes: ExpectedValues,
    broker_echoes: ExpectedValues,
    watch: Option<Subscription>,
}

impl ValueBridge {
    /// Register the value's topics; `None` if the node has no metadata for it
    pub fn new(
        broker: &dyn Broker,
        topics: &NodeTopics,
        node: Arc<dyn Node>,
        value_id: ValueId,
    ) -> Option<Self> {
        let Some(metadata) = node.value_metadata(&value_id) else {
            warn!(
                "Node {}: no metadata for value {}, not bridged",
                node.id(),
                value_id
            );
            return None;
        };

        let topic = topics.value(&metadata.label);
        let metadata_topic = NodeTopics::metadata(&topic);
        let mut broker_echoes = ExpectedValues::new();

        let behaviour = if metadata.readable {
            Behaviour::PropertyOneToMany
        } else {
            Behaviour::EventManyToOne
        };
        broker.register(
            &topic,
            behaviour,
            &describe(&value_id, &metadata),
            RegisterOptions::cleanup(),
        );

        if metadata.readable {
            if let Some(current) = node.value(&value_id) {
                // Our own property watch will see the seed
                if metadata.writeable {
                    broker_echoes.push(current.clone());
                }
                broker.set_property(&topic, current);
            }
        }

        let watch = match (metadata.writeable, metadata.readable) {
            (true, true) => Some(broker.watch_property(&topic)),
            (true, false) => Some(broker.watch_event(&topic)),
            (false, _) => None,
        };

        broker.register(
            &metadata_topic,
            Behaviour::PropertyOneToMany,
            "Information describing the value",
            RegisterOptions::cleanup(),
        );
        match serde_json::to_value(&metadata) {
            Ok(snapshot) => broker.set_property(&metadata_topic, snapshot),
            Err(e) => warn!("Node {}: cannot encode metadata of {}: {}", node.id(), value_id, e),
        }

        debug!("Node {}: bridged value {} at {}", node.id(), value_id, topic);

        Some(Self {
            node,
            value_id,
            metadata,
            topic,
            metadata_topic,
            device_echoes: ExpectedValues::new(),
            broker_echoes,
            watch,
        })
    }

    pub fn value_id(&self) -> &ValueId {
        &self.value_id
    }

    pub fn metadata(&self) -> &ValueMetadata {
        &self.metadata
    }

    /// Value topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metadata_topic(&self) -> &str {
        &self.metadata_topic
    }

    /// Values written to the device whose update has not arrived yet
    pub fn device_echoes(&self) -> &ExpectedValues {
        &self.device_echoes
    }

    /// Values published to the broker whose delivery has not arrived yet
    pub fn broker_echoes(&self) -> &ExpectedValues {
        &self.broker_echoes
    }

    /// A value on the node changed
    pub fn handle_device_update(&mut self, broker: &dyn Broker, update: &ValueUpdate) {
        if update.value_id != self.value_id || !self.metadata.readable {
            return;
        }

        if self.device_echoes.take(&update.new_value) {
            debug!(
                "Node {}: absorbed echo of {} = {}",
                self.node.id(),
                self.value_id,
                update.new_value
            );
            return;
        }

        if self.watch.is_some() {
            self.broker_echoes.push(update.new_value.clone());
        }
        broker.set_property(&self.topic, update.new_value.clone());
    }

    /// A value arrived on the value topic
    pub fn handle_broker_write(&mut self, value: Option<&Value>) -> Result<(), DeviceError> {
        if self.watch.is_none() {
            return Ok(());
        }
        let Some(value) = value else {
            return Ok(());
        };

        if self.broker_echoes.take(value) {
            debug!(
                "Node {}: absorbed echo of {} = {}",
                self.node.id(),
                self.value_id,
                value
            );
            return Ok(());
        }

        // The device reports readable values back after the write
        if self.metadata.readable {
            self.device_echoes.push(value.clone());
        }
        debug!("Node {}: writing {} = {}", self.node.id(), self.value_id, value);
        self.node.set_value(&self.value_id, value.clone())
    }

    /// Unregister both topics and drop the watch
    ///
    /// Returns the broker echoes that may still be delivered on the value
    /// topic after the watch is gone.
    pub fn teardown(self, broker: &dyn Broker) -> Option<PendingEchoes> {
        broker.unregister(&self.topic);
        if let Some(watch) = self.watch {
            broker.unwatch(watch);
        }
        broker.unregister(&self.metadata_topic);

        if self.broker_echoes.is_empty() {
            return None;
        }
        Some(PendingEchoes {
            topic: self.topic,
            values: self.broker_echoes,
        })
    }
}
