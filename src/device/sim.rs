//! Simulated Device Network
//!
//! An in-process controller whose nodes and values come from the
//! `[network]` section of the configuration. It behaves like a driver
//! towards the bridge: writes are reported back as value updates, healing
//! reports progress, inclusion and exclusion report their phases.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    Controller, DeviceConfig, DeviceError, DeviceEvent, HealStatus, Node, NodeId, OperationKind,
    OperationPhase, ValueId, ValueMetadata, ValueUpdate,
};
use crate::config::{NetworkConfig, NodeConfig, ValueConfig};
use crate::event::EventSender;

fn emit(events: &EventSender, event: DeviceEvent) {
    if events.send(event.into()).is_err() {
        debug!("Sim network: event queue closed");
    }
}

struct SimValue {
    id: ValueId,
    metadata: ValueMetadata,
    current: Option<Value>,
}

impl SimValue {
    fn from_config(config: &ValueConfig) -> Self {
        let mut id = ValueId::new(config.command_class, config.endpoint, config.property.clone());
        id.property_key = config.property_key.clone();

        let metadata = ValueMetadata {
            label: config.label.clone(),
            readable: config.readable,
            writeable: config.writeable,
            value_type: config.value_type.clone(),
            description: None,
            min: config.min,
            max: config.max,
            unit: config.unit.clone(),
            command_class_name: config.command_class_name.clone(),
            property_name: Some(config.property.to_string()),
            property_key_name: config.property_key.as_ref().map(|k| k.to_string()),
        };

        Self {
            id,
            metadata,
            current: config.value.clone(),
        }
    }
}

/// A simulated node
pub struct SimNode {
    id: NodeId,
    config: Option<DeviceConfig>,
    neighbors: Vec<NodeId>,
    ready: AtomicBool,
    values: Mutex<Vec<SimValue>>,
    writes: AtomicUsize,
    events: EventSender,
}

impl SimNode {
    fn new(config: &NodeConfig, events: EventSender) -> Self {
        let device_config = if config.manufacturer.is_some() || config.description.is_some() {
            Some(DeviceConfig {
                manufacturer: config.manufacturer.clone().unwrap_or_default(),
                description: config.description.clone().unwrap_or_default(),
            })
        } else {
            None
        };

        Self {
            id: config.id,
            config: device_config,
            neighbors: config.neighbors.clone(),
            ready: AtomicBool::new(false),
            values: Mutex::new(config.values.iter().map(SimValue::from_config).collect()),
            writes: AtomicUsize::new(0),
            events,
        }
    }

    /// Number of accepted writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Change a value as the device itself would (e.g. a physical switch)
    pub fn report_value(&self, value_id: &ValueId, value: Value) -> Result<(), DeviceError> {
        let prev_value = {
            let mut values = self.values.lock();
            let entry = values
                .iter_mut()
                .find(|v| &v.id == value_id)
                .ok_or_else(|| DeviceError::ValueNotFound(self.id, value_id.clone()))?;
            entry.current.replace(value.clone())
        };
        self.report(value_id.clone(), value, prev_value);
        Ok(())
    }

    fn report(&self, value_id: ValueId, new_value: Value, prev_value: Option<Value>) {
        emit(
            &self.events,
            DeviceEvent::ValueUpdated {
                node_id: self.id,
                update: ValueUpdate {
                    value_id,
                    new_value,
                    prev_value,
                },
            },
        );
    }
}

impl Node for SimNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn defined_value_ids(&self) -> Vec<ValueId> {
        self.values.lock().iter().map(|v| v.id.clone()).collect()
    }

    fn value_metadata(&self, value_id: &ValueId) -> Option<ValueMetadata> {
        self.values
            .lock()
            .iter()
            .find(|v| &v.id == value_id)
            .map(|v| v.metadata.clone())
    }

    fn value(&self, value_id: &ValueId) -> Option<Value> {
        self.values
            .lock()
            .iter()
            .find(|v| &v.id == value_id)
            .and_then(|v| v.current.clone())
    }

    fn set_value(&self, value_id: &ValueId, value: Value) -> Result<(), DeviceError> {
        let (readable, prev_value) = {
            let mut values = self.values.lock();
            let entry = values
                .iter_mut()
                .find(|v| &v.id == value_id)
                .ok_or_else(|| DeviceError::ValueNotFound(self.id, value_id.clone()))?;
            if !entry.metadata.writeable {
                return Err(DeviceError::NotWriteable(self.id, value_id.clone()));
            }
            (entry.metadata.readable, entry.current.replace(value.clone()))
        };

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("Sim node {}: set {} = {}", self.id, value_id, value);

        // Write-only values have no state to report back
        if readable {
            self.report(value_id.clone(), value, prev_value);
        }
        Ok(())
    }

    fn device_config(&self) -> Option<DeviceConfig> {
        self.config.clone()
    }

    fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.clone()
    }

    fn refresh_values(&self) {
        let current: Vec<(ValueId, Value)> = self
            .values
            .lock()
            .iter()
            .filter(|v| v.metadata.readable)
            .filter_map(|v| v.current.clone().map(|c| (v.id.clone(), c)))
            .collect();

        debug!("Sim node {}: refreshing {} values", self.id, current.len());
        for (value_id, value) in current {
            self.report(value_id, value.clone(), Some(value));
        }
    }
}

#[derive(Debug, Default)]
struct Operations {
    healing: bool,
    inclusion: bool,
    exclusion: bool,
}

impl Operations {
    fn flag(&mut self, kind: OperationKind) -> &mut bool {
        match kind {
            OperationKind::Inclusion => &mut self.inclusion,
            OperationKind::Exclusion => &mut self.exclusion,
        }
    }
}

/// Simulated controller and its nodes
pub struct SimNetwork {
    nodes: RwLock<BTreeMap<NodeId, Arc<SimNode>>>,
    operations: Mutex<Operations>,
    events: EventSender,
}

impl SimNetwork {
    /// Build the network from configuration; nothing is reported until [`start`](Self::start)
    pub fn new(config: &NetworkConfig, events: EventSender) -> Arc<Self> {
        let nodes = config
            .nodes
            .iter()
            .map(|node| (node.id, Arc::new(SimNode::new(node, events.clone()))))
            .collect();

        Arc::new(Self {
            nodes: RwLock::new(nodes),
            operations: Mutex::new(Operations::default()),
            events,
        })
    }

    /// Bring the driver up and finish every node interview
    pub fn start(&self) {
        let nodes: Vec<Arc<SimNode>> = self.nodes.read().values().cloned().collect();
        info!("Sim network: starting with {} nodes", nodes.len());

        self.emit(DeviceEvent::DriverReady);
        for node in nodes {
            node.ready.store(true, Ordering::Release);
            self.emit(DeviceEvent::NodeReady(node.id));
        }
        self.emit(DeviceEvent::AllNodesReady);
    }

    /// Concrete handle of a node
    pub fn sim_node(&self, id: NodeId) -> Option<Arc<SimNode>> {
        self.nodes.read().get(&id).cloned()
    }

    /// Join a node to the network; its interview is still pending
    ///
    /// A node with the same id is replaced.
    pub fn add_node(&self, config: &NodeConfig) {
        let node = Arc::new(SimNode::new(config, self.events.clone()));
        self.nodes.write().insert(config.id, node);
        info!("Sim network: node {} added", config.id);
        self.emit(DeviceEvent::NodeAdded(config.id));
    }

    /// Finish the interview of a node
    pub fn mark_ready(&self, id: NodeId) -> Result<(), DeviceError> {
        let node = self.sim_node(id).ok_or(DeviceError::NodeNotFound(id))?;
        node.ready.store(true, Ordering::Release);
        self.emit(DeviceEvent::NodeReady(id));
        Ok(())
    }

    /// Simulate a device-originated value change
    pub fn report_value(
        &self,
        id: NodeId,
        value_id: &ValueId,
        value: Value,
    ) -> Result<(), DeviceError> {
        self.sim_node(id)
            .ok_or(DeviceError::NodeNotFound(id))?
            .report_value(value_id, value)
    }

    /// Start defining a new value on a node
    pub fn define_value(&self, id: NodeId, config: &ValueConfig) -> Result<ValueId, DeviceError> {
        let node = self.sim_node(id).ok_or(DeviceError::NodeNotFound(id))?;
        let value = SimValue::from_config(config);
        let value_id = value.id.clone();
        {
            let mut values = node.values.lock();
            values.retain(|v| v.id != value_id);
            values.push(value);
        }
        self.emit(DeviceEvent::ValueAdded {
            node_id: id,
            value_id: value_id.clone(),
        });
        Ok(value_id)
    }

    /// Stop defining a value on a node
    pub fn undefine_value(&self, id: NodeId, value_id: &ValueId) -> Result<(), DeviceError> {
        let node = self.sim_node(id).ok_or(DeviceError::NodeNotFound(id))?;
        {
            let mut values = node.values.lock();
            let before = values.len();
            values.retain(|v| &v.id != value_id);
            if values.len() == before {
                return Err(DeviceError::ValueNotFound(id, value_id.clone()));
            }
        }
        self.emit(DeviceEvent::ValueRemoved {
            node_id: id,
            value_id: value_id.clone(),
        });
        Ok(())
    }

    /// Whether a heal is running
    pub fn is_healing(&self) -> bool {
        self.operations.lock().healing
    }

    /// Whether an inclusion or exclusion is running
    pub fn is_running(&self, kind: OperationKind) -> bool {
        *self.operations.lock().flag(kind)
    }

    /// End a running inclusion or exclusion unsuccessfully
    pub fn fail_operation(&self, kind: OperationKind) {
        *self.operations.lock().flag(kind) = false;
        self.emit(DeviceEvent::Operation {
            kind,
            phase: OperationPhase::Failed,
        });
    }

    /// Report a driver error
    pub fn fail(&self, message: impl Into<String>) {
        self.emit(DeviceEvent::DriverError(message.into()));
    }

    fn emit(&self, event: DeviceEvent) {
        emit(&self.events, event);
    }

    fn begin_operation(&self, kind: OperationKind) -> Result<(), DeviceError> {
        {
            let mut operations = self.operations.lock();
            let other = match kind {
                OperationKind::Inclusion => operations.exclusion,
                OperationKind::Exclusion => operations.inclusion,
            };
            if other {
                return Err(DeviceError::Rejected(format!(
                    "cannot begin {} while another operation is running",
                    kind
                )));
            }
            let flag = operations.flag(kind);
            if *flag {
                return Ok(());
            }
            *flag = true;
        }
        info!("Sim network: {} started", kind);
        self.emit(DeviceEvent::Operation {
            kind,
            phase: OperationPhase::Started,
        });
        Ok(())
    }

    fn stop_operation(&self, kind: OperationKind) -> Result<(), DeviceError> {
        let was_running = std::mem::replace(self.operations.lock().flag(kind), false);
        if was_running {
            info!("Sim network: {} stopped", kind);
            self.emit(DeviceEvent::Operation {
                kind,
                phase: OperationPhase::Stopped,
            });
        }
        Ok(())
    }
}

impl Controller for SimNetwork {
    fn nodes(&self) -> Vec<Arc<dyn Node>> {
        self.nodes
            .read()
            .values()
            .map(|node| node.clone() as Arc<dyn Node>)
            .collect()
    }

    fn node(&self, id: NodeId) -> Option<Arc<dyn Node>> {
        self.sim_node(id).map(|node| node as Arc<dyn Node>)
    }

    fn begin_healing_network(&self) -> Result<(), DeviceError> {
        let ids: Vec<NodeId> = self.nodes.read().keys().copied().collect();
        self.operations.lock().healing = true;
        info!("Sim network: healing {} nodes", ids.len());

        let snapshot = |status: HealStatus| -> BTreeMap<NodeId, HealStatus> {
            ids.iter().map(|id| (*id, status)).collect()
        };
        self.emit(DeviceEvent::HealProgress(snapshot(HealStatus::Pending)));
        self.emit(DeviceEvent::HealProgress(snapshot(HealStatus::Done)));

        self.operations.lock().healing = false;
        self.emit(DeviceEvent::HealDone);
        Ok(())
    }

    fn stop_healing_network(&self) -> Result<(), DeviceError> {
        self.operations.lock().healing = false;
        Ok(())
    }

    fn begin_inclusion(&self) -> Result<(), DeviceError> {
        self.begin_operation(OperationKind::Inclusion)
    }

    fn stop_inclusion(&self) -> Result<(), DeviceError> {
        self.stop_operation(OperationKind::Inclusion)
    }

    fn begin_exclusion(&self) -> Result<(), DeviceError> {
        self.begin_operation(OperationKind::Exclusion)
    }

    fn stop_exclusion(&self) -> Result<(), DeviceError> {
        self.stop_operation(OperationKind::Exclusion)
    }

    fn remove_failed_node(&self, id: NodeId) -> Result<(), DeviceError> {
        self.nodes
            .write()
            .remove(&id)
            .ok_or(DeviceError::NodeNotFound(id))?;
        info!("Sim network: node {} removed", id);
        self.emit(DeviceEvent::NodeRemoved(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::Config;
    use crate::event::{self, BridgeEvent, EventReceiver};

    const NETWORK: &str = r#"
[[network.nodes]]
id = 5
manufacturer = "Fibargroup"
description = "Dimmer 2"
neighbors = [1]

[[network.nodes.values]]
command_class = 38
command_class_name = "Multilevel Switch"
property = "targetValue"
label = "Target Value"
writeable = true
value_type = "number"
value = 0

[[network.nodes.values]]
command_class = 38
property = "currentValue"
label = "Current value"
value = 0

[[network.nodes]]
id = 7
"#;

    fn network() -> (Arc<SimNetwork>, EventReceiver) {
        let config = Config::parse(NETWORK).unwrap();
        let (tx, rx) = event::channel();
        (SimNetwork::new(&config.network, tx), rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                BridgeEvent::Device(event) => events.push(event),
                other => panic!("unexpected event {:?}", other),
            }
        }
        events
    }

    fn target() -> ValueId {
        ValueId::new(38, 0, "targetValue")
    }

    #[test]
    fn test_start_reports_readiness() {
        let (net, mut rx) = network();
        assert!(!net.node(5).unwrap().is_ready());

        net.start();
        assert_eq!(
            drain(&mut rx),
            vec![
                DeviceEvent::DriverReady,
                DeviceEvent::NodeReady(5),
                DeviceEvent::NodeReady(7),
                DeviceEvent::AllNodesReady,
            ]
        );
        assert!(net.node(7).unwrap().is_ready());
    }

    #[test]
    fn test_node_attributes() {
        let (net, _rx) = network();
        let node = net.node(5).unwrap();
        assert_eq!(
            node.device_config(),
            Some(DeviceConfig {
                manufacturer: "Fibargroup".to_string(),
                description: "Dimmer 2".to_string(),
            })
        );
        assert_eq!(node.neighbors(), vec![1]);
        assert_eq!(node.defined_value_ids().len(), 2);
        assert!(net.node(7).unwrap().device_config().is_none());

        let metadata = node.value_metadata(&target()).unwrap();
        assert_eq!(metadata.label, "Target Value");
        assert!(metadata.writeable);
        assert_eq!(metadata.property_name.as_deref(), Some("targetValue"));
    }

    #[test]
    fn test_set_value_reports_update() {
        let (net, mut rx) = network();
        let node = net.node(5).unwrap();

        node.set_value(&target(), json!(50)).unwrap();
        assert_eq!(node.value(&target()), Some(json!(50)));
        assert_eq!(net.sim_node(5).unwrap().write_count(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![DeviceEvent::ValueUpdated {
                node_id: 5,
                update: ValueUpdate {
                    value_id: target(),
                    new_value: json!(50),
                    prev_value: Some(json!(0)),
                },
            }]
        );
    }

    #[test]
    fn test_set_value_errors() {
        let (net, _rx) = network();
        let node = net.node(5).unwrap();

        let current = ValueId::new(38, 0, "currentValue");
        assert_eq!(
            node.set_value(&current, json!(1)),
            Err(DeviceError::NotWriteable(5, current.clone()))
        );

        let missing = ValueId::new(37, 0, "currentValue");
        assert_eq!(
            node.set_value(&missing, json!(1)),
            Err(DeviceError::ValueNotFound(5, missing.clone()))
        );
    }

    #[test]
    fn test_refresh_reports_readable_values() {
        let (net, mut rx) = network();
        net.node(5).unwrap().refresh_values();
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_add_and_remove_nodes() {
        let (net, mut rx) = network();
        let config: NodeConfig = toml::from_str("id = 9").unwrap();

        net.add_node(&config);
        assert!(!net.node(9).unwrap().is_ready());
        net.mark_ready(9).unwrap();
        assert!(net.node(9).unwrap().is_ready());

        net.remove_failed_node(9).unwrap();
        assert!(net.node(9).is_none());
        assert_eq!(
            net.remove_failed_node(9),
            Err(DeviceError::NodeNotFound(9))
        );

        assert_eq!(
            drain(&mut rx),
            vec![
                DeviceEvent::NodeAdded(9),
                DeviceEvent::NodeReady(9),
                DeviceEvent::NodeRemoved(9),
            ]
        );
    }

    #[test]
    fn test_healing_reports_progress_then_done() {
        let (net, mut rx) = network();
        net.begin_healing_network().unwrap();
        assert!(!net.is_healing());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        match &events[0] {
            DeviceEvent::HealProgress(progress) => {
                assert_eq!(progress.get(&5), Some(&HealStatus::Pending));
                assert_eq!(progress.get(&7), Some(&HealStatus::Pending));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events[2], DeviceEvent::HealDone);
    }

    #[test]
    fn test_inclusion_phases() {
        let (net, mut rx) = network();

        // Stopping an idle operation reports nothing
        net.stop_inclusion().unwrap();
        net.begin_inclusion().unwrap();
        assert!(net.is_running(OperationKind::Inclusion));
        assert!(net.begin_exclusion().is_err());
        net.stop_inclusion().unwrap();
        assert!(!net.is_running(OperationKind::Inclusion));

        assert_eq!(
            drain(&mut rx),
            vec![
                DeviceEvent::Operation {
                    kind: OperationKind::Inclusion,
                    phase: OperationPhase::Started,
                },
                DeviceEvent::Operation {
                    kind: OperationKind::Inclusion,
                    phase: OperationPhase::Stopped,
                },
            ]
        );
    }

    #[test]
    fn test_define_and_undefine_value() {
        let (net, mut rx) = network();
        let config: ValueConfig = toml::from_str(
            r#"
command_class = 50
property = "value"
property_key = 65537
label = "Electric Consumption (W)"
"#,
        )
        .unwrap();

        let value_id = net.define_value(7, &config).unwrap();
        assert_eq!(value_id.property_key, Some(65537u32.into()));
        assert_eq!(net.node(7).unwrap().defined_value_ids(), vec![value_id.clone()]);

        net.undefine_value(7, &value_id).unwrap();
        assert!(net.undefine_value(7, &value_id).is_err());
        assert_eq!(drain(&mut rx).len(), 2);
    }
}
