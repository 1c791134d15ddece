//! Bridge Event Queue
//!
//! Device notifications and broker deliveries share a single queue. The
//! network bridge drains it one event at a time, so handlers never run
//! concurrently and bridge state needs no locking.

use tokio::sync::mpsc;

use crate::broker::BrokerMessage;
use crate::device::DeviceEvent;

/// One item on the event queue
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Something happened on the device network
    Device(DeviceEvent),
    /// A watched broker topic received a value
    Broker(BrokerMessage),
}

impl From<DeviceEvent> for BridgeEvent {
    fn from(event: DeviceEvent) -> Self {
        BridgeEvent::Device(event)
    }
}

impl From<BrokerMessage> for BridgeEvent {
    fn from(message: BrokerMessage) -> Self {
        BridgeEvent::Broker(message)
    }
}

/// Producer side of the event queue
pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;

/// Consumer side of the event queue
pub type EventReceiver = mpsc::UnboundedReceiver<BridgeEvent>;

/// Create the event queue
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
