//! Device Network Interface
//!
//! The bridge never talks to the radio itself. It consumes a device-network
//! driver through the [`Controller`] and [`Node`] traits and receives every
//! driver, controller and node notification as a [`DeviceEvent`] on the
//! shared event queue.
//!
//! # Value Identity
//!
//! A value on a node is addressed by its [`ValueId`]: command class,
//! endpoint, property and optional property key. Two values on the same node
//! never share an identity.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod sim;

pub use sim::SimNetwork;

/// Node identifier on the mesh network
pub type NodeId = u16;

/// Property or property key of a value: either a name or a numeric index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Property {
    /// Numeric property (e.g. a parameter number)
    Index(u32),
    /// Named property (e.g. "targetValue")
    Name(String),
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Index(index) => write!(f, "{}", index),
            Property::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for Property {
    fn from(name: &str) -> Self {
        Property::Name(name.to_string())
    }
}

impl From<u32> for Property {
    fn from(index: u32) -> Self {
        Property::Index(index)
    }
}

/// Identity of one value on one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueId {
    pub command_class: u8,
    #[serde(default)]
    pub endpoint: u8,
    pub property: Property,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key: Option<Property>,
}

impl ValueId {
    pub fn new(command_class: u8, endpoint: u8, property: impl Into<Property>) -> Self {
        Self {
            command_class,
            endpoint,
            property: property.into(),
            property_key: None,
        }
    }

    pub fn with_property_key(mut self, key: impl Into<Property>) -> Self {
        self.property_key = Some(key.into());
        self
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.command_class, self.endpoint, self.property
        )?;
        if let Some(ref key) = self.property_key {
            write!(f, "-{}", key)?;
        }
        Ok(())
    }
}

/// Descriptive record for a value, published verbatim on its metadata topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMetadata {
    /// Human-readable label, source of the topic name
    pub label: String,
    pub readable: bool,
    pub writeable: bool,
    /// Value type as reported by the driver ("number", "boolean", "string", "any", ...)
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub command_class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key_name: Option<String>,
}

/// Resolved device configuration of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub manufacturer: String,
    pub description: String,
}

/// Per-node status while the network heals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealStatus {
    Pending,
    Done,
    Failed,
    Skipped,
}

/// Controller operations that are started and stopped from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Admitting a new node into the network
    Inclusion,
    /// Removing a node from the network
    Exclusion,
}

impl OperationKind {
    pub const ALL: [OperationKind; 2] = [OperationKind::Inclusion, OperationKind::Exclusion];

    /// Lowercase name used in topic paths and log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Inclusion => "inclusion",
            OperationKind::Exclusion => "exclusion",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notification of a controller operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Started,
    Failed,
    Stopped,
}

/// A value changed on a node
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub value_id: ValueId,
    pub new_value: Value,
    pub prev_value: Option<Value>,
}

/// Everything the device network reports to the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The driver finished starting and the controller is usable
    DriverReady,
    /// The driver hit an error; not necessarily fatal
    DriverError(String),
    /// Every known node finished its interview
    AllNodesReady,
    /// A node's configuration and values are loaded
    NodeReady(NodeId),
    /// A node joined (or re-joined) the network
    NodeAdded(NodeId),
    /// A node left the network
    NodeRemoved(NodeId),
    /// A value on a node changed
    ValueUpdated { node_id: NodeId, update: ValueUpdate },
    /// A node started defining a new value
    ValueAdded { node_id: NodeId, value_id: ValueId },
    /// A node no longer defines a value
    ValueRemoved { node_id: NodeId, value_id: ValueId },
    /// Snapshot of the per-node healing status
    HealProgress(BTreeMap<NodeId, HealStatus>),
    /// Network healing finished
    HealDone,
    /// Inclusion or exclusion changed phase
    Operation {
        kind: OperationKind,
        phase: OperationPhase,
    },
}

/// Device network error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No node with this id exists
    NodeNotFound(NodeId),
    /// The node does not define this value
    ValueNotFound(NodeId, ValueId),
    /// The value cannot be written
    NotWriteable(NodeId, ValueId),
    /// The driver refused the request
    Rejected(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NodeNotFound(id) => write!(f, "Node {} not found", id),
            DeviceError::ValueNotFound(id, value_id) => {
                write!(f, "Node {} has no value {}", id, value_id)
            }
            DeviceError::NotWriteable(id, value_id) => {
                write!(f, "Value {} on node {} is not writeable", value_id, id)
            }
            DeviceError::Rejected(msg) => write!(f, "Rejected: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// One addressable device on the mesh network
pub trait Node: Send + Sync {
    /// Node identifier
    fn id(&self) -> NodeId;

    /// Whether the node already finished its interview
    ///
    /// A node that is ready before the bridge sees it will not report
    /// [`DeviceEvent::NodeReady`] again.
    fn is_ready(&self) -> bool;

    /// Every value currently defined on the node
    fn defined_value_ids(&self) -> Vec<ValueId>;

    /// Metadata of a value, `None` if the value is not defined
    fn value_metadata(&self, value_id: &ValueId) -> Option<ValueMetadata>;

    /// Current value, `None` if unknown
    fn value(&self, value_id: &ValueId) -> Option<Value>;

    /// Write a value to the device
    ///
    /// Returns once the write is issued; the device reports the outcome
    /// later as a [`DeviceEvent::ValueUpdated`].
    fn set_value(&self, value_id: &ValueId, value: Value) -> Result<(), DeviceError>;

    /// Resolved device configuration, `None` for unknown devices
    fn device_config(&self) -> Option<DeviceConfig>;

    /// Node ids of the radio neighbours
    fn neighbors(&self) -> Vec<NodeId>;

    /// Poll every value of the node again
    fn refresh_values(&self);
}

/// The network controller
pub trait Controller: Send + Sync {
    /// Every node currently known to the controller
    fn nodes(&self) -> Vec<Arc<dyn Node>>;

    /// Look up a single node
    fn node(&self, id: NodeId) -> Option<Arc<dyn Node>>;

    fn begin_healing_network(&self) -> Result<(), DeviceError>;

    fn stop_healing_network(&self) -> Result<(), DeviceError>;

    fn begin_inclusion(&self) -> Result<(), DeviceError>;

    fn stop_inclusion(&self) -> Result<(), DeviceError>;

    fn begin_exclusion(&self) -> Result<(), DeviceError>;

    fn stop_exclusion(&self) -> Result<(), DeviceError>;

    /// Forcibly remove a node the controller considers failed
    fn remove_failed_node(&self, id: NodeId) -> Result<(), DeviceError>;
}
