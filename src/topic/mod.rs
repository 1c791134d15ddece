//! Topic Namespace
//!
//! Derives every topic path the bridge uses from the configured prefix.
//! Paths are pure functions of their inputs, so a path derived twice from
//! the same node id and label is always the same.
//!
//! ```text
//! <prefix>state
//! <prefix>heal_network
//! <prefix>heal_network/progress
//! <prefix>inclusion_mode          <prefix>inclusion_mode/result
//! <prefix>exclusion_mode          <prefix>exclusion_mode/result
//! <prefix>nodes/<id>/manufacturer_name
//! <prefix>nodes/<id>/description
//! <prefix>nodes/<id>/neighbors
//! <prefix>nodes/<id>/refresh_values
//! <prefix>nodes/<id>/remove_failed_node
//! <prefix>nodes/<id>/values/<sanitized-label>
//! <prefix>nodes/<id>/values/<sanitized-label>/metadata
//! ```

use std::sync::LazyLock;

use regex::Regex;

use crate::device::{NodeId, OperationKind};

pub mod validation;

pub use validation::{validate_prefix, validate_topic_name};

/// Replaces each run of characters outside `[A-Za-z0-9()]`
static LABEL_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9()]+").expect("valid label pattern"));

/// Separator inserted for every run of unsupported label characters
pub const LABEL_SEPARATOR: &str = "-";

/// Turn a value label into a single topic level
///
/// Two labels that only differ in punctuation or whitespace map to the same
/// level; the bridge does not try to disambiguate them.
pub fn sanitize_label(label: &str) -> String {
    LABEL_SEPARATORS
        .replace_all(label, LABEL_SEPARATOR)
        .into_owned()
}

/// Topic paths under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Controller status
    pub fn state(&self) -> String {
        format!("{}state", self.prefix)
    }

    /// Heal command
    pub fn heal_network(&self) -> String {
        format!("{}heal_network", self.prefix)
    }

    /// Per-node heal progress
    pub fn heal_progress(&self) -> String {
        format!("{}heal_network/progress", self.prefix)
    }

    /// Inclusion or exclusion command
    pub fn operation_mode(&self, kind: OperationKind) -> String {
        format!("{}{}_mode", self.prefix, kind.as_str())
    }

    /// Inclusion or exclusion result
    pub fn operation_result(&self, kind: OperationKind) -> String {
        format!("{}{}_mode/result", self.prefix, kind.as_str())
    }

    /// Subtree of one node
    pub fn node(&self, id: NodeId) -> NodeTopics {
        NodeTopics {
            prefix: format!("{}nodes/{}/", self.prefix, id),
        }
    }

    /// Node id of a topic inside some node subtree
    pub fn node_id_of(&self, topic: &str) -> Option<NodeId> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix("nodes/")?;
        let (id, _) = rest.split_once('/')?;
        id.parse().ok()
    }
}

/// Topic paths inside one node subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopics {
    prefix: String,
}

impl NodeTopics {
    /// `<prefix>nodes/<id>/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn manufacturer_name(&self) -> String {
        format!("{}manufacturer_name", self.prefix)
    }

    pub fn description(&self) -> String {
        format!("{}description", self.prefix)
    }

    pub fn neighbors(&self) -> String {
        format!("{}neighbors", self.prefix)
    }

    pub fn refresh_values(&self) -> String {
        format!("{}refresh_values", self.prefix)
    }

    pub fn remove_failed_node(&self) -> String {
        format!("{}remove_failed_node", self.prefix)
    }

    /// Topic of a value, from its label
    pub fn value(&self, label: &str) -> String {
        format!("{}values/{}", self.prefix, sanitize_label(label))
    }

    /// Metadata topic of a value topic
    pub fn metadata(value_topic: &str) -> String {
        format!("{}/metadata", value_topic)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("Target Value", "Target-Value" ; "space")]
    #[test_case("Current value", "Current-value" ; "lowercase")]
    #[test_case("Electric Consumption (W)", "Electric-Consumption-(W)" ; "keeps parentheses")]
    #[test_case("Param 3: LED / mode", "Param-3-LED-mode" ; "collapses runs")]
    #[test_case("  padded  ", "-padded-" ; "edges")]
    #[test_case("Température", "Temp-rature" ; "non ascii")]
    #[test_case("plain", "plain" ; "unchanged")]
    fn test_sanitize_label(label: &str, expected: &str) {
        assert_eq!(sanitize_label(label), expected);
    }

    #[test]
    fn test_controller_topics() {
        let topics = Topics::new("sys/zwave/");
        assert_eq!(topics.state(), "sys/zwave/state");
        assert_eq!(topics.heal_network(), "sys/zwave/heal_network");
        assert_eq!(topics.heal_progress(), "sys/zwave/heal_network/progress");
        assert_eq!(
            topics.operation_mode(OperationKind::Inclusion),
            "sys/zwave/inclusion_mode"
        );
        assert_eq!(
            topics.operation_result(OperationKind::Exclusion),
            "sys/zwave/exclusion_mode/result"
        );
    }

    #[test]
    fn test_node_topics() {
        let node = Topics::new("sys/zwave/").node(5);
        assert_eq!(node.prefix(), "sys/zwave/nodes/5/");
        assert_eq!(node.manufacturer_name(), "sys/zwave/nodes/5/manufacturer_name");
        assert_eq!(node.description(), "sys/zwave/nodes/5/description");
        assert_eq!(node.neighbors(), "sys/zwave/nodes/5/neighbors");
        assert_eq!(node.refresh_values(), "sys/zwave/nodes/5/refresh_values");
        assert_eq!(
            node.remove_failed_node(),
            "sys/zwave/nodes/5/remove_failed_node"
        );

        let value = node.value("Target Value");
        assert_eq!(value, "sys/zwave/nodes/5/values/Target-Value");
        assert_eq!(
            NodeTopics::metadata(&value),
            "sys/zwave/nodes/5/values/Target-Value/metadata"
        );
    }

    #[test]
    fn test_node_id_of() {
        let topics = Topics::new("sys/zwave/");
        assert_eq!(
            topics.node_id_of("sys/zwave/nodes/5/values/Target-Value"),
            Some(5)
        );
        assert_eq!(topics.node_id_of("sys/zwave/nodes/12/refresh_values"), Some(12));
        assert_eq!(topics.node_id_of("sys/zwave/nodes/x/description"), None);
        assert_eq!(topics.node_id_of("sys/zwave/nodes/5"), None);
        assert_eq!(topics.node_id_of("sys/zwave/state"), None);
        assert_eq!(topics.node_id_of("other/nodes/5/description"), None);
    }

    proptest! {
        #[test]
        fn prop_value_topic_is_deterministic(id in 1u16..=4000, label in "\\PC{0,40}") {
            let first = Topics::new("sys/zwave/").node(id).value(&label);
            let second = Topics::new("sys/zwave/").node(id).value(&label);
            prop_assert_eq!(&first, &second);

            let level = first.rsplit('/').next().unwrap_or_default();
            prop_assert!(level
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '(' || c == ')' || c == '-'));
            prop_assert!(!level.contains("--"));
            prop_assert_eq!(Topics::new("sys/zwave/").node_id_of(&first), Some(id));
        }
    }
}
