//! Device Network Bridge
//!
//! Mirrors the device network into the broker namespace and relays writes
//! in both directions.
//!
//! - [`ValueBridge`]: one device value as a value topic plus a metadata topic
//! - [`NodeBridge`]: one node as a topic subtree with attribute and control topics
//! - [`NetworkBridge`]: controller status, healing, inclusion/exclusion and
//!   the node registry
//!
//! # Echo Suppression
//!
//! A value the bridge writes to one side comes back from the other side as
//! an ordinary update. Each [`ValueBridge`] remembers what it sent in an
//! [`ExpectedValues`] queue and absorbs exactly one matching update per
//! entry, so a write never ping-pongs between broker and device.
//!
//! ```text
//! broker write 50 ──► push 50, device.set_value(50)
//! device update 50 ─► take 50, nothing published
//! device update 51 ─► push 51, broker.set_property(51)
//! broker echo 51 ───► take 51, nothing written
//! ```

mod expected;
mod network;
mod node;
mod operation;
mod value;


use std::fmt;

pub use expected::ExpectedValues;
pub use network::{DriverState, NetworkBridge};
pub use node::NodeBridge;
pub use operation::{HealBridge, OperationBridge, OperationState};
pub use value::{PendingEchoes, ValueBridge};

use crate::device::DeviceError;

/// Bridge error types
///
/// Only device write failures leave the bridge; everything else is logged
/// where it happens.
#[derive(Debug)]
pub enum BridgeError {
    /// A write to the device network failed
    Device(DeviceError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Device(e) => write!(f, "Device error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Device(e) => Some(e),
        }
    }
}

impl From<DeviceError> for BridgeError {
    fn from(e: DeviceError) -> Self {
        BridgeError::Device(e)
    }
}
