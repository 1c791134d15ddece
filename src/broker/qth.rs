//! Qth Broker Client
//!
//! Speaks the Qth conventions on top of a plain MQTT connection (rumqttc):
//!
//! - The client's topic registrations are one retained JSON document on
//!   `meta/clients/<client_id>`, republished whenever it changes and after
//!   every reconnect. The last will clears it, so the registrar drops every
//!   `delete_on_unregister` property when the bridge disappears uncleanly.
//! - Properties are retained publishes of a JSON payload; events are plain
//!   publishes. An empty payload means "no value".
//!
//! The [`Broker`] methods only queue a command for the connection task and
//! return. Publishing, subscribing and reconnecting happen in the background.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{Behaviour, Broker, BrokerMessage, RegisterOptions, Subscription, WatchKind};
use crate::config::BrokerConfig;
use crate::event::EventSender;

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

/// How long shutdown waits for the connection task
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Registrar document topic of a client
pub fn meta_topic(client_id: &str) -> String {
    format!("meta/clients/{}", client_id)
}

/// One topic in the registrar document
#[derive(Debug, Clone, PartialEq, Serialize)]
struct TopicEntry {
    behaviour: &'static str,
    description: String,
    delete_on_unregister: bool,
}

#[derive(Serialize)]
struct ClientDocument<'a> {
    description: &'a str,
    topics: &'a BTreeMap<String, TopicEntry>,
}

fn client_document(description: &str, topics: &BTreeMap<String, TopicEntry>) -> Vec<u8> {
    serde_json::to_vec(&ClientDocument {
        description,
        topics,
    })
    .unwrap_or_default()
}

/// Ask the command task to restore registration and subscriptions
fn request_resync(command_tx: &mpsc::UnboundedSender<QthCommand>) -> bool {
    if command_tx.send(QthCommand::Resync).is_err() {
        debug!("Qth: command task stopped, skipping resync");
        return false;
    }
    true
}

/// Decode a received payload; `None` if it is not valid JSON
fn decode_payload(payload: &[u8]) -> Option<Option<Value>> {
    if payload.is_empty() {
        return Some(None);
    }
    serde_json::from_slice(payload).ok().map(Some)
}

/// Reference counts of live watches per topic
#[derive(Debug, Default)]
struct Watches {
    counts: HashMap<String, usize>,
}

impl Watches {
    /// Returns true for the first watch on the topic
    fn add(&mut self, topic: &str) -> bool {
        let count = self.counts.entry(topic.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the last watch on the topic went away
    fn remove(&mut self, topic: &str) -> bool {
        match self.counts.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(topic);
                true
            }
            None => false,
        }
    }

    fn topics(&self) -> impl Iterator<Item = &String> {
        self.counts.keys()
    }
}

/// Message to send to the connection task
#[derive(Debug)]
enum QthCommand {
    Register { topic: String, entry: TopicEntry },
    Unregister { topic: String },
    SetProperty { topic: String, payload: Vec<u8> },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Connection re-established: restore registration and subscriptions
    Resync,
    Shutdown(oneshot::Sender<()>),
}

/// Qth client over MQTT
pub struct QthClient {
    client_id: String,
    command_tx: mpsc::UnboundedSender<QthCommand>,
    next_subscription_id: AtomicU64,
}

impl QthClient {
    /// Start the connection and command tasks
    ///
    /// Must be called inside a tokio runtime. Deliveries on watched topics
    /// are pushed to `events`.
    pub fn connect(host: &str, port: u16, config: &BrokerConfig, events: EventSender) -> Self {
        let meta = meta_topic(&config.client_id);

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive_duration());
        options.set_last_will(LastWill::new(
            meta.clone(),
            Vec::new(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        info!(
            "Qth: connecting to {}:{} as '{}'",
            host, port, config.client_id
        );

        tokio::spawn(Self::command_loop(
            client,
            meta,
            config.description.clone(),
            command_rx,
        ));
        tokio::spawn(Self::poll_loop(
            eventloop,
            command_tx.clone(),
            events,
            config.reconnect_interval,
            config.max_reconnect_interval,
        ));

        Self {
            client_id: config.client_id.clone(),
            command_tx,
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Clear the registration and disconnect
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.command_tx.send(QthCommand::Shutdown(ack_tx)).is_err() {
            return;
        }
        if timeout(SHUTDOWN_TIMEOUT, ack_rx).await.is_err() {
            warn!("Qth '{}': shutdown timed out", self.client_id);
        }
    }

    fn send(&self, command: QthCommand) {
        if let Err(e) = self.command_tx.send(command) {
            debug!(
                "Qth '{}': connection task stopped, dropping {:?}",
                self.client_id, e.0
            );
        }
    }

    fn watch(&self, topic: &str, kind: WatchKind) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.send(QthCommand::Subscribe {
            topic: topic.to_string(),
        });
        Subscription::new(id, topic, kind)
    }

    fn unwatch_topic(&self, subscription: Subscription) {
        self.send(QthCommand::Unsubscribe {
            topic: subscription.topic().to_string(),
        });
    }

    /// Apply queued commands to the MQTT client
    async fn command_loop(
        client: AsyncClient,
        meta: String,
        description: String,
        mut command_rx: mpsc::UnboundedReceiver<QthCommand>,
    ) {
        let mut topics: BTreeMap<String, TopicEntry> = BTreeMap::new();
        let mut watches = Watches::default();

        let publish_registration = |topics: &BTreeMap<String, TopicEntry>| {
            let client = client.clone();
            let meta = meta.clone();
            let document = client_document(&description, topics);
            async move {
                if let Err(e) = client.publish(meta, QoS::AtLeastOnce, true, document).await {
                    warn!("Qth: failed to publish registration: {}", e);
                }
            }
        };

        while let Some(command) = command_rx.recv().await {
            match command {
                QthCommand::Register { topic, entry } => {
                    debug!("Qth: register {} ({})", topic, entry.behaviour);
                    topics.insert(topic, entry);
                    publish_registration(&topics).await;
                }
                QthCommand::Unregister { topic } => {
                    debug!("Qth: unregister {}", topic);
                    if topics.remove(&topic).is_some() {
                        publish_registration(&topics).await;
                    }
                }
                QthCommand::SetProperty { topic, payload } => {
                    if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, true, payload).await {
                        warn!("Qth: failed to set {}: {}", topic, e);
                    }
                }
                QthCommand::Subscribe { topic } => {
                    if watches.add(&topic) {
                        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                            warn!("Qth: failed to subscribe to {}: {}", topic, e);
                        }
                    }
                }
                QthCommand::Unsubscribe { topic } => {
                    if watches.remove(&topic) {
                        if let Err(e) = client.unsubscribe(&topic).await {
                            warn!("Qth: failed to unsubscribe from {}: {}", topic, e);
                        }
                    }
                }
                QthCommand::Resync => {
                    info!(
                        "Qth: restoring {} registrations and {} subscriptions",
                        topics.len(),
                        watches.counts.len()
                    );
                    publish_registration(&topics).await;
                    for topic in watches.topics() {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            warn!("Qth: failed to subscribe to {}: {}", topic, e);
                        }
                    }
                }
                QthCommand::Shutdown(ack) => {
                    info!("Qth: shutting down");
                    if let Err(e) = client.publish(&meta, QoS::AtLeastOnce, true, Vec::new()).await
                    {
                        warn!("Qth: failed to clear registration: {}", e);
                    }
                    if let Err(e) = client.disconnect().await {
                        warn!("Qth: failed to disconnect: {}", e);
                    }
                    let _ = ack.send(());
                    break;
                }
            }
        }
    }

    /// Drive the MQTT connection and forward deliveries to the event queue
    async fn poll_loop(
        mut eventloop: EventLoop,
        command_tx: mpsc::UnboundedSender<QthCommand>,
        events: EventSender,
        reconnect_interval: Duration,
        max_reconnect_interval: Duration,
    ) {
        let mut retry_interval = reconnect_interval;
        let mut connected_before = false;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(value) = decode_payload(&publish.payload) else {
                        warn!("Qth: dropping non-JSON payload on {}", publish.topic);
                        continue;
                    };
                    if events
                        .send(BrokerMessage::new(publish.topic, value).into())
                        .is_err()
                    {
                        debug!("Qth: event queue closed");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Qth: connected");
                    retry_interval = reconnect_interval;
                    // Requests queued before the first connection go out as is
                    if connected_before {
                        request_resync(&command_tx);
                    }
                    connected_before = true;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Qth: disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Qth: connection error: {}", e);
                    debug!("Qth: reconnecting in {:?}", retry_interval);

                    // Exponential backoff
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, max_reconnect_interval);
                }
            }
        }
    }
}

impl Broker for QthClient {
    fn register(
        &self,
        topic: &str,
        behaviour: Behaviour,
        description: &str,
        options: RegisterOptions,
    ) {
        self.send(QthCommand::Register {
            topic: topic.to_string(),
            entry: TopicEntry {
                behaviour: behaviour.as_str(),
                description: description.to_string(),
                delete_on_unregister: options.delete_on_unregister,
            },
        });
    }

    fn unregister(&self, topic: &str) {
        self.send(QthCommand::Unregister {
            topic: topic.to_string(),
        });
    }

    fn set_property(&self, topic: &str, value: Value) {
        match serde_json::to_vec(&value) {
            Ok(payload) => self.send(QthCommand::SetProperty {
                topic: topic.to_string(),
                payload,
            }),
            Err(e) => warn!("Qth: cannot encode value for {}: {}", topic, e),
        }
    }

    fn watch_property(&self, topic: &str) -> Subscription {
        self.watch(topic, WatchKind::Property)
    }

    fn unwatch_property(&self, subscription: Subscription) {
        self.unwatch_topic(subscription);
    }

    fn watch_event(&self, topic: &str) -> Subscription {
        self.watch(topic, WatchKind::Event)
    }

    fn unwatch_event(&self, subscription: Subscription) {
        self.unwatch_topic(subscription);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_meta_topic() {
        assert_eq!(meta_topic("qth_zwave"), "meta/clients/qth_zwave");
    }

    #[test]
    fn test_client_document() {
        let mut topics = BTreeMap::new();
        topics.insert(
            "sys/zwave/state".to_string(),
            TopicEntry {
                behaviour: Behaviour::PropertyOneToMany.as_str(),
                description: "Human-readable state".to_string(),
                delete_on_unregister: true,
            },
        );

        let document: Value =
            serde_json::from_slice(&client_document("A Qth/ZWave bridge", &topics)).unwrap();
        assert_eq!(
            document,
            json!({
                "description": "A Qth/ZWave bridge",
                "topics": {
                    "sys/zwave/state": {
                        "behaviour": "PROPERTY-1:N",
                        "description": "Human-readable state",
                        "delete_on_unregister": true,
                    }
                }
            })
        );
    }

    #[test]
    fn test_request_resync() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(request_resync(&tx));
        assert!(matches!(rx.try_recv(), Ok(QthCommand::Resync)));

        drop(rx);
        assert!(!request_resync(&tx));
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(b""), Some(None));
        assert_eq!(decode_payload(b"50"), Some(Some(json!(50))));
        assert_eq!(decode_payload(b"\"remove\""), Some(Some(json!("remove"))));
        assert_eq!(decode_payload(b"{\"a\":null}"), Some(Some(json!({"a": null}))));
        assert_eq!(decode_payload(b"remove"), None);
    }

    #[test]
    fn test_watches_are_reference_counted() {
        let mut watches = Watches::default();
        assert!(watches.add("a"));
        assert!(!watches.add("a"));
        assert!(watches.add("b"));

        assert!(!watches.remove("a"));
        assert!(watches.remove("a"));
        assert!(!watches.remove("a"));
        assert_eq!(watches.topics().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_are_dropped() {
        let (events, _rx) = crate::event::channel();
        let config = BrokerConfig::default();
        // Nothing listens on port 1; the poll task just keeps backing off
        let client = QthClient::connect("127.0.0.1", 1, &config, events);

        let sub = client.watch_property("sys/zwave/state");
        assert_eq!(sub.kind(), WatchKind::Property);
        client.shutdown().await;

        client.set_property("sys/zwave/state", json!("starting"));
        client.unwatch(sub);
    }
}
