//! Network Bridge
//!
//! Owns the controller-level topics and the node registry, and drains the
//! event queue.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{
    BridgeError, ExpectedValues, HealBridge, NodeBridge, OperationBridge, OperationState,
    PendingEchoes,
};
use crate::broker::{Behaviour, Broker, BrokerMessage, RegisterOptions};
use crate::device::{Controller, DeviceEvent, HealStatus, NodeId, OperationKind};
use crate::event::{BridgeEvent, EventReceiver};
use crate::topic::Topics;

/// Driver status published on `<prefix>state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Starting,
    /// Not necessarily terminal
    Error(String),
    DriverReady,
    AllNodesReady,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Starting => f.write_str("starting"),
            DriverState::Error(e) => write!(f, "error: {}", e),
            DriverState::DriverReady => f.write_str("driver ready"),
            DriverState::AllNodesReady => f.write_str("all nodes ready"),
        }
    }
}

/// Keep the in-flight echoes of torn-down values so they are not mistaken
/// for writes to whatever takes over the topic
fn retire(
    stale: &mut HashMap<String, ExpectedValues>,
    pending: impl IntoIterator<Item = PendingEchoes>,
) {
    for echoes in pending {
        stale.entry(echoes.topic).or_default().append(echoes.values);
    }
}

/// Topics set up once the driver is ready
struct ControllerTopics {
    heal: HealBridge,
    operations: Vec<OperationBridge>,
}

impl ControllerTopics {
    fn operation_mut(&mut self, kind: OperationKind) -> Option<&mut OperationBridge> {
        self.operations.iter_mut().find(|op| op.kind() == kind)
    }
}

/// Top-level bridge between one controller and one broker
pub struct NetworkBridge {
    broker: Arc<dyn Broker>,
    controller: Arc<dyn Controller>,
    topics: Topics,
    state: DriverState,
    controller_topics: Option<ControllerTopics>,
    nodes: HashMap<NodeId, NodeBridge>,
    /// Broker echoes of torn-down value bridges, by value topic
    stale_echoes: HashMap<String, ExpectedValues>,
}

impl NetworkBridge {
    /// Register the status topic and publish `starting`
    pub fn new(
        broker: Arc<dyn Broker>,
        controller: Arc<dyn Controller>,
        prefix: impl Into<String>,
    ) -> Self {
        let topics = Topics::new(prefix);

        broker.register(
            &topics.state(),
            Behaviour::PropertyOneToMany,
            "Human-readable state of the ZWave network interface.",
            RegisterOptions::cleanup(),
        );

        let bridge = Self {
            broker,
            controller,
            topics,
            state: DriverState::Starting,
            controller_topics: None,
            nodes: HashMap::new(),
            stale_echoes: HashMap::new(),
        };
        bridge.publish_state();
        bridge
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    /// Whether the driver reported ready at least once
    pub fn is_ready(&self) -> bool {
        self.controller_topics.is_some()
    }

    /// Ids of every tracked node, sorted
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeBridge> {
        self.nodes.get(&id)
    }

    /// Healing status, `None` while not healing or before the driver is ready
    pub fn heal_progress(&self) -> Option<&BTreeMap<NodeId, HealStatus>> {
        self.controller_topics
            .as_ref()
            .and_then(|topics| topics.heal.progress())
    }

    /// State of the last inclusion or exclusion
    pub fn operation_state(&self, kind: OperationKind) -> OperationState {
        self.controller_topics
            .as_ref()
            .and_then(|topics| topics.operations.iter().find(|op| op.kind() == kind))
            .map_or(OperationState::Idle, |op| op.state())
    }

    /// Handle one event to completion
    pub fn handle_event(&mut self, event: BridgeEvent) -> Result<(), BridgeError> {
        match event {
            BridgeEvent::Device(event) => {
                self.handle_device_event(event);
                Ok(())
            }
            BridgeEvent::Broker(message) => self.handle_message(&message),
        }
    }

    /// Handle every event already queued, including the ones queued while handling
    pub fn process_pending(&mut self, events: &mut EventReceiver) -> Result<usize, BridgeError> {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Drain the event queue until it closes or `shutdown` resolves
    pub async fn run<F>(&mut self, mut events: EventReceiver, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            error!("Bridge: {}", e);
                            break Err(e);
                        }
                    }
                    None => {
                        info!("Bridge: event queue closed");
                        break Ok(());
                    }
                },
                _ = &mut shutdown => {
                    info!("Bridge: shutdown requested");
                    break Ok(());
                }
            }
        };

        self.shutdown();
        result
    }

    /// Tear down every node and unregister the controller topics
    pub fn shutdown(&mut self) {
        info!("Bridge: removing {} nodes", self.nodes.len());
        for (_, node) in self.nodes.drain() {
            node.teardown(self.broker.as_ref());
        }
        self.stale_echoes.clear();
        if let Some(topics) = self.controller_topics.take() {
            topics.heal.teardown(self.broker.as_ref());
            for operation in topics.operations {
                operation.teardown(self.broker.as_ref());
            }
        }
        self.broker.unregister(&self.topics.state());
    }

    fn set_state(&mut self, state: DriverState) {
        self.state = state;
        self.publish_state();
    }

    fn publish_state(&self) {
        info!("Bridge: {}", self.state);
        self.broker
            .set_property(&self.topics.state(), Value::String(self.state.to_string()));
    }

    fn handle_device_event(&mut self, event: DeviceEvent) {
        let broker = self.broker.as_ref();

        match event {
            DeviceEvent::DriverReady => {
                self.set_state(DriverState::DriverReady);
                if self.controller_topics.is_none() {
                    self.setup();
                }
            }
            DeviceEvent::DriverError(e) => {
                warn!("Bridge: driver error: {}", e);
                self.set_state(DriverState::Error(e));
            }
            DeviceEvent::AllNodesReady => self.set_state(DriverState::AllNodesReady),
            DeviceEvent::NodeReady(id) => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.handle_ready(broker);
                }
            }
            DeviceEvent::NodeAdded(id) => {
                if self.controller_topics.is_none() {
                    debug!("Bridge: node {} added before driver ready, ignoring", id);
                    return;
                }
                self.add_node(id);
            }
            DeviceEvent::NodeRemoved(id) => {
                if let Some(node) = self.nodes.remove(&id) {
                    info!("Bridge: node {} removed", id);
                    let pending = node.teardown(broker);
                    retire(&mut self.stale_echoes, pending);
                }
            }
            DeviceEvent::ValueUpdated { node_id, update } => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.handle_value_updated(broker, &update);
                }
            }
            DeviceEvent::ValueAdded { node_id, value_id } => {
                let pending = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|node| node.handle_value_added(broker, value_id));
                retire(&mut self.stale_echoes, pending);
            }
            DeviceEvent::ValueRemoved { node_id, value_id } => {
                let pending = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|node| node.handle_value_removed(broker, &value_id));
                retire(&mut self.stale_echoes, pending);
            }
            DeviceEvent::HealProgress(progress) => {
                if let Some(ref mut topics) = self.controller_topics {
                    topics.heal.handle_progress(broker, &progress);
                }
            }
            DeviceEvent::HealDone => {
                if let Some(ref mut topics) = self.controller_topics {
                    topics.heal.handle_done(broker);
                }
            }
            DeviceEvent::Operation { kind, phase } => {
                if let Some(operation) = self
                    .controller_topics
                    .as_mut()
                    .and_then(|topics| topics.operation_mut(kind))
                {
                    operation.handle_phase(broker, phase);
                }
            }
        }
    }

    fn handle_message(&mut self, message: &BrokerMessage) -> Result<(), BridgeError> {
        let broker = self.broker.as_ref();
        let controller = self.controller.as_ref();

        if let Some(ref mut topics) = self.controller_topics {
            if topics.heal.command_topic() == message.topic {
                topics.heal.handle_command(broker, controller, message.value.as_ref());
                return Ok(());
            }
            if let Some(operation) = topics
                .operations
                .iter()
                .find(|op| op.mode_topic() == message.topic)
            {
                operation.handle_command(controller, message.value.as_ref());
                return Ok(());
            }
        }

        // Echo of a value published by a bridge that has since been replaced
        if let (Some(value), Some(stale)) = (
            message.value.as_ref(),
            self.stale_echoes.get_mut(&message.topic),
        ) {
            if stale.take(value) {
                debug!("Bridge: dropping stale echo on {}", message.topic);
                if stale.is_empty() {
                    self.stale_echoes.remove(&message.topic);
                }
                return Ok(());
            }
        }

        match self
            .topics
            .node_id_of(&message.topic)
            .and_then(|id| self.nodes.get_mut(&id))
        {
            Some(node) => node.handle_message(controller, message)?,
            None => debug!("Bridge: no handler for {}", message.topic),
        }
        Ok(())
    }

    /// One-time setup after the driver first reports ready
    fn setup(&mut self) {
        let broker = self.broker.as_ref();

        let heal = HealBridge::new(broker, &self.topics);
        let operations = OperationKind::ALL
            .iter()
            .map(|kind| OperationBridge::new(broker, &self.topics, *kind))
            .collect();
        self.controller_topics = Some(ControllerTopics { heal, operations });

        for node in self.controller.nodes() {
            let id = node.id();
            if let Some(previous) = self.nodes.remove(&id) {
                let pending = previous.teardown(broker);
                retire(&mut self.stale_echoes, pending);
            }
            self.nodes
                .insert(id, NodeBridge::new(broker, &self.topics, node));
        }
        info!("Bridge: tracking {} nodes", self.nodes.len());
    }

    /// Track a node, replacing any bridge already registered under its id
    fn add_node(&mut self, id: NodeId) {
        let broker = self.broker.as_ref();

        if let Some(previous) = self.nodes.remove(&id) {
            info!("Bridge: node {} re-added, replacing", id);
            let pending = previous.teardown(broker);
            retire(&mut self.stale_echoes, pending);
        }

        match self.controller.node(id) {
            Some(node) => {
                info!("Bridge: node {} added", id);
                self.nodes
                    .insert(id, NodeBridge::new(broker, &self.topics, node));
            }
            None => warn!("Bridge: node {} added but unknown to the controller", id),
        }
    }
}
