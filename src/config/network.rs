//! Simulated Device Network Configuration
//!
//! Describes the nodes served by the in-process device network.

use serde::Deserialize;
use serde_json::Value;

use crate::device::{NodeId, Property};

/// Simulated network configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Nodes known to the controller at startup
    #[serde(alias = "node")]
    pub nodes: Vec<NodeConfig>,
}

/// A simulated node
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Node id (1-based, unique)
    pub id: NodeId,

    /// Manufacturer name from the device configuration
    #[serde(default)]
    pub manufacturer: Option<String>,

    /// Device description from the device configuration
    #[serde(default)]
    pub description: Option<String>,

    /// Radio neighbours
    #[serde(default)]
    pub neighbors: Vec<NodeId>,

    /// Values defined on the node
    #[serde(default, alias = "value")]
    pub values: Vec<ValueConfig>,
}

/// A simulated value
#[derive(Debug, Clone, Deserialize)]
pub struct ValueConfig {
    pub command_class: u8,

    #[serde(default)]
    pub command_class_name: String,

    #[serde(default)]
    pub endpoint: u8,

    pub property: Property,

    #[serde(default)]
    pub property_key: Option<Property>,

    /// Label shown to users, source of the topic name
    pub label: String,

    #[serde(default = "default_true")]
    pub readable: bool,

    #[serde(default)]
    pub writeable: bool,

    /// Value type ("number", "boolean", "string", "any", ...)
    #[serde(default = "default_value_type")]
    pub value_type: String,

    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    /// Initial value
    #[serde(default)]
    pub value: Option<Value>,
}

fn default_true() -> bool {
    true
}

fn default_value_type() -> String {
    "any".to_string()
}
