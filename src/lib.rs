//! zwavemq - Z-Wave to Qth bridge
//!
//! Mirrors a Z-Wave device network into a Qth (MQTT) topic namespace: every
//! node value, node attribute and controller operation becomes a topic that
//! can be read, watched or commanded.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod device;
pub mod event;
pub mod topic;

pub use bridge::{BridgeError, NetworkBridge, NodeBridge, ValueBridge};
pub use broker::{Broker, MemoryBroker, QthClient};
pub use config::Config;
pub use device::{Controller, Node, SimNetwork};
pub use event::BridgeEvent;
pub use topic::Topics;
