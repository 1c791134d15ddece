//! Broker Connection Configuration

use std::time::Duration;

use serde::Deserialize;

/// Default MQTT port when the URI has none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Where the bridge publishes its topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    /// Qth over MQTT on a TCP connection
    Mqtt { host: String, port: u16 },
    /// In-process broker, nothing leaves the process
    Memory,
}

/// Broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URI: `tcp://host:port`, `mqtt://host:port` or `memory://`
    pub uri: String,

    /// Client ID used both for MQTT and for the Qth registration
    pub client_id: String,

    /// Client description shown by the registrar
    pub description: String,

    /// Prefix of every topic the bridge registers (must end with `/`)
    pub prefix: String,

    /// Keep-alive interval in seconds
    pub keep_alive: u16,

    /// Initial delay before reconnecting (e.g., "1s", "500ms")
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Maximum delay between reconnect attempts (exponential backoff)
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

fn default_uri() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "qth_zwave".to_string()
}

fn default_description() -> String {
    "A Qth/ZWave bridge".to_string()
}

fn default_prefix() -> String {
    "sys/zwave/".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            client_id: default_client_id(),
            description: default_description(),
            prefix: default_prefix(),
            keep_alive: 60,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Get the keep-alive interval as Duration
    pub fn keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive as u64)
    }

    /// Parse the broker URI
    pub fn endpoint(&self) -> Result<BrokerEndpoint, String> {
        let (scheme, rest) = self
            .uri
            .split_once("://")
            .ok_or_else(|| format!("broker uri '{}' has no scheme", self.uri))?;

        match scheme {
            "memory" => Ok(BrokerEndpoint::Memory),
            "tcp" | "mqtt" => {
                let authority = rest.trim_end_matches('/');
                if authority.is_empty() {
                    return Err(format!("broker uri '{}' has no host", self.uri));
                }
                match authority.rsplit_once(':') {
                    Some((host, port)) => {
                        let port = port
                            .parse::<u16>()
                            .map_err(|_| format!("invalid port in broker uri '{}'", self.uri))?;
                        Ok(BrokerEndpoint::Mqtt {
                            host: host.to_string(),
                            port,
                        })
                    }
                    None => Ok(BrokerEndpoint::Mqtt {
                        host: authority.to_string(),
                        port: DEFAULT_MQTT_PORT,
                    }),
                }
            }
            other => Err(format!("unsupported broker uri scheme '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_uri(uri: &str) -> BrokerConfig {
        BrokerConfig {
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_with_port() {
        assert_eq!(
            with_uri("tcp://broker.local:9883").endpoint().unwrap(),
            BrokerEndpoint::Mqtt {
                host: "broker.local".to_string(),
                port: 9883
            }
        );
    }

    #[test]
    fn test_endpoint_without_port() {
        assert_eq!(
            with_uri("mqtt://broker.local").endpoint().unwrap(),
            BrokerEndpoint::Mqtt {
                host: "broker.local".to_string(),
                port: DEFAULT_MQTT_PORT
            }
        );
    }

    #[test]
    fn test_endpoint_memory() {
        assert_eq!(
            with_uri("memory://").endpoint().unwrap(),
            BrokerEndpoint::Memory
        );
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        assert!(with_uri("wss://example.com/qth/ws").endpoint().is_err());
        assert!(with_uri("localhost:1883").endpoint().is_err());
        assert!(with_uri("tcp://host:notaport").endpoint().is_err());
        assert!(with_uri("tcp://").endpoint().is_err());
    }
}
