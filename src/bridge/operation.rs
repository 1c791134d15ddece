//! Controller Operations
//!
//! Healing and inclusion/exclusion exposed as broker-observable state.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::broker::{Behaviour, Broker, RegisterOptions, Subscription};
use crate::device::{
    Controller, DeviceError, HealStatus, NodeId, OperationKind, OperationPhase,
};
use crate::topic::Topics;

/// Begin an inclusion or exclusion on the controller
fn begin(controller: &dyn Controller, kind: OperationKind) -> Result<(), DeviceError> {
    match kind {
        OperationKind::Inclusion => controller.begin_inclusion(),
        OperationKind::Exclusion => controller.begin_exclusion(),
    }
}

/// Stop an inclusion or exclusion on the controller
fn stop(controller: &dyn Controller, kind: OperationKind) -> Result<(), DeviceError> {
    match kind {
        OperationKind::Inclusion => controller.stop_inclusion(),
        OperationKind::Exclusion => controller.stop_exclusion(),
    }
}

/// State of the last inclusion or exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    /// Nothing reported yet
    #[default]
    Idle,
    InProgress,
    Failed,
    /// Finished successfully or stopped on request
    Stopped,
}

impl OperationState {
    /// Value of the result topic, `None` while idle
    pub fn result(&self) -> Option<&'static str> {
        match self {
            OperationState::Idle => None,
            OperationState::InProgress => Some("in progress"),
            OperationState::Failed => Some("failed"),
            OperationState::Stopped => Some("success or manually stopped"),
        }
    }
}

impl From<OperationPhase> for OperationState {
    fn from(phase: OperationPhase) -> Self {
        match phase {
            OperationPhase::Started => OperationState::InProgress,
            OperationPhase::Failed => OperationState::Failed,
            OperationPhase::Stopped => OperationState::Stopped,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.result().unwrap_or("idle"))
    }
}

/// Inclusion or exclusion: a mode topic to command it, a result topic to follow it
pub struct OperationBridge {
    kind: OperationKind,
    mode_topic: String,
    result_topic: String,
    state: OperationState,
    watch: Subscription,
}

impl OperationBridge {
    pub fn new(broker: &dyn Broker, topics: &Topics, kind: OperationKind) -> Self {
        let mode_topic = topics.operation_mode(kind);
        let result_topic = topics.operation_result(kind);

        broker.register(
            &mode_topic,
            Behaviour::PropertyManyToOne,
            &format!("Set to true to begin {kind} and false to stop {kind}."),
            RegisterOptions::cleanup(),
        );
        broker.register(
            &result_topic,
            Behaviour::PropertyOneToMany,
            &format!("Stores the state of the last {kind} operation."),
            RegisterOptions::cleanup(),
        );
        broker.set_property(&mode_topic, Value::Bool(false));
        let watch = broker.watch_property(&mode_topic);

        Self {
            kind,
            mode_topic,
            result_topic,
            state: OperationState::Idle,
            watch,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn mode_topic(&self) -> &str {
        &self.mode_topic
    }

    pub fn result_topic(&self) -> &str {
        &self.result_topic
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// A value arrived on the mode topic
    pub fn handle_command(&self, controller: &dyn Controller, value: Option<&Value>) {
        let result = match value {
            Some(Value::Bool(true)) => {
                info!("Controller: begin {}", self.kind);
                begin(controller, self.kind)
            }
            Some(Value::Bool(false)) => {
                debug!("Controller: stop {}", self.kind);
                stop(controller, self.kind)
            }
            other => {
                debug!("Controller: ignoring {} command {:?}", self.kind, other);
                return;
            }
        };
        if let Err(e) = result {
            warn!("Controller: {} command failed: {}", self.kind, e);
        }
    }

    /// The controller reported a phase change
    pub fn handle_phase(&mut self, broker: &dyn Broker, phase: OperationPhase) {
        self.state = phase.into();
        info!("Controller: {} {}", self.kind, self.state);
        if let Some(result) = self.state.result() {
            broker.set_property(&self.result_topic, json!(result));
        }
    }

    pub fn teardown(self, broker: &dyn Broker) {
        broker.unwatch(self.watch);
        broker.unregister(&self.mode_topic);
        broker.unregister(&self.result_topic);
    }
}

/// Network healing: a command channel and a progress property
pub struct HealBridge {
    command_topic: String,
    progress_topic: String,
    progress: Option<BTreeMap<NodeId, HealStatus>>,
    watch: Subscription,
}

impl HealBridge {
    pub fn new(broker: &dyn Broker, topics: &Topics) -> Self {
        let command_topic = topics.heal_network();
        let progress_topic = topics.heal_progress();

        broker.register(
            &command_topic,
            Behaviour::EventManyToOne,
            "Send a non-false value to start healing, send false to stop it.",
            RegisterOptions::default(),
        );
        broker.register(
            &progress_topic,
            Behaviour::PropertyOneToMany,
            "An object giving the healing status of each node (or null if not healing)",
            RegisterOptions::cleanup(),
        );
        broker.set_property(&progress_topic, Value::Null);
        let watch = broker.watch_event(&command_topic);

        Self {
            command_topic,
            progress_topic,
            progress: None,
            watch,
        }
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn progress_topic(&self) -> &str {
        &self.progress_topic
    }

    /// Per-node status, `None` while not healing
    pub fn progress(&self) -> Option<&BTreeMap<NodeId, HealStatus>> {
        self.progress.as_ref()
    }

    /// A value arrived on the command channel
    ///
    /// `false` stops healing and any other value starts it. An absent
    /// payload is ignored rather than treated as a start.
    pub fn handle_command(
        &mut self,
        broker: &dyn Broker,
        controller: &dyn Controller,
        value: Option<&Value>,
    ) {
        match value {
            None => debug!("Controller: ignoring empty heal command"),
            Some(Value::Bool(false)) => {
                info!("Controller: stop healing");
                if let Err(e) = controller.stop_healing_network() {
                    warn!("Controller: failed to stop healing: {}", e);
                }
                self.publish(broker, None);
            }
            Some(_) => {
                info!("Controller: begin healing");
                match controller.begin_healing_network() {
                    Ok(()) => self.publish(broker, Some(BTreeMap::new())),
                    Err(e) => warn!("Controller: failed to begin healing: {}", e),
                }
            }
        }
    }

    /// The controller reported a progress snapshot
    pub fn handle_progress(&mut self, broker: &dyn Broker, progress: &BTreeMap<NodeId, HealStatus>) {
        self.publish(broker, Some(progress.clone()));
    }

    /// The controller finished healing
    pub fn handle_done(&mut self, broker: &dyn Broker) {
        info!("Controller: healing done");
        self.publish(broker, None);
    }

    fn publish(&mut self, broker: &dyn Broker, progress: Option<BTreeMap<NodeId, HealStatus>>) {
        let value = match &progress {
            Some(progress) => serde_json::to_value(progress).unwrap_or(Value::Null),
            None => Value::Null,
        };
        self.progress = progress;
        broker.set_property(&self.progress_topic, value);
    }

    pub fn teardown(self, broker: &dyn Broker) {
        broker.unwatch(self.watch);
        broker.unregister(&self.command_topic);
        broker.unregister(&self.progress_topic);
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(OperationPhase::Started, Some("in progress") ; "started")]
    #[test_case(OperationPhase::Failed, Some("failed") ; "failed")]
    #[test_case(OperationPhase::Stopped, Some("success or manually stopped") ; "stopped")]
    fn test_phase_result(phase: OperationPhase, expected: Option<&str>) {
        assert_eq!(OperationState::from(phase).result(), expected);
    }

    #[test]
    fn test_idle_has_no_result() {
        assert_eq!(OperationState::default(), OperationState::Idle);
        assert_eq!(OperationState::Idle.result(), None);
        assert_eq!(OperationState::Idle.to_string(), "idle");
    }
}
