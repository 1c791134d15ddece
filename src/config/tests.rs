//! Config module tests

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::device::Property;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("ZWAVEMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${ZWAVEMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("ZWAVEMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("ZWAVEMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${ZWAVEMQ_TEST_VAR_UNSET:-fallback}\"");
    assert_eq!(result, "value = \"fallback\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.broker.uri, "tcp://localhost:1883");
    assert_eq!(config.broker.prefix, "sys/zwave/");
    assert_eq!(config.broker.client_id, "qth_zwave");
    assert_eq!(config.broker.reconnect_interval, Duration::from_secs(1));
    assert!(config.network.nodes.is_empty());
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[broker]
uri = "tcp://qth.local:1884"
client_id = "zwave-test"
prefix = "home/zwave/"
keep_alive = 30
reconnect_interval = "500ms"
max_reconnect_interval = "10s"

[[network.nodes]]
id = 5
manufacturer = "Fibargroup"
description = "Dimmer 2"
neighbors = [1, 7]

[[network.nodes.values]]
command_class = 38
command_class_name = "Multilevel Switch"
property = "targetValue"
label = "Target Value"
writeable = true
value_type = "number"
min = 0
max = 99
value = 0

[[network.nodes.values]]
command_class = 112
property = 3
property_key = "low"
label = "Param 3"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.broker.client_id, "zwave-test");
    assert_eq!(config.broker.prefix, "home/zwave/");
    assert_eq!(config.broker.keep_alive, 30);
    assert_eq!(config.broker.reconnect_interval, Duration::from_millis(500));
    assert_eq!(config.broker.max_reconnect_interval, Duration::from_secs(10));

    assert_eq!(config.network.nodes.len(), 1);
    let node = &config.network.nodes[0];
    assert_eq!(node.id, 5);
    assert_eq!(node.neighbors, vec![1, 7]);
    assert_eq!(node.values.len(), 2);

    let target = &node.values[0];
    assert_eq!(target.property, Property::Name("targetValue".to_string()));
    assert!(target.readable);
    assert!(target.writeable);
    assert_eq!(target.max, Some(99.0));

    let param = &node.values[1];
    assert_eq!(param.property, Property::Index(3));
    assert_eq!(param.property_key, Some(Property::Name("low".to_string())));
    assert!(!param.writeable);
    assert_eq!(param.value_type, "any");
}

#[test]
fn test_invalid_prefix() {
    let toml = r#"
[broker]
prefix = "sys/zwave"
"#;
    assert!(Config::parse(toml).is_err());

    let toml = r##"
[broker]
prefix = "sys/#/"
"##;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_broker_uri() {
    let toml = r#"
[broker]
uri = "wss://example.com/qth/ws"
"#;
    assert!(matches!(
        Config::parse(toml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_invalid_reconnect_intervals() {
    let toml = r#"
[broker]
reconnect_interval = "10s"
max_reconnect_interval = "1s"
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_duplicate_node_ids() {
    let toml = r#"
[[network.nodes]]
id = 2

[[network.nodes]]
id = 2
"#;
    let err = Config::parse(toml).unwrap_err();
    assert!(err.to_string().contains("node 2"));
}

#[test]
fn test_node_id_zero_rejected() {
    let toml = r#"
[[network.nodes]]
id = 0
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("zwavemq.toml");

    std::env::set_var("ZWAVEMQ_TEST_BROKER_HOST", "10.0.0.2");

    let config_content = r#"
[broker]
uri = "tcp://${ZWAVEMQ_TEST_BROKER_HOST}:${ZWAVEMQ_TEST_BROKER_PORT:-1885}"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.broker.uri, "tcp://10.0.0.2:1885");
    assert_eq!(
        config.broker.endpoint().unwrap(),
        BrokerEndpoint::Mqtt {
            host: "10.0.0.2".to_string(),
            port: 1885
        }
    );

    std::env::remove_var("ZWAVEMQ_TEST_BROKER_HOST");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.broker.prefix, "sys/zwave/");
    assert_eq!(config.broker.max_reconnect_interval, Duration::from_secs(30));
}
