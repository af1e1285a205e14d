use crate::ack::{CommitStrategy, FailureStrategy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
pub const ACKS: &str = "acks";
pub const CLIENT_ID: &str = "client.id";
pub const KEY_SERIALIZER: &str = "key.serializer";
pub const VALUE_SERIALIZER: &str = "value.serializer";
pub const TRANSACTIONAL_ID: &str = "transactional.id";
pub const RECONNECT_BACKOFF_MAX_MS: &str = "reconnect.backoff.max.ms";

/// Keys understood by this crate but unknown to librdkafka, which rejects
/// unknown properties at client creation.
const CONNECTOR_KEYS: &[&str] = &[
    KEY_SERIALIZER,
    VALUE_SERIALIZER,
    "channel-name",
    "topic",
    "close-timeout",
    "lazy-client",
    "key-serialization-failure-handler",
    "value-serialization-failure-handler",
    "commit-strategy",
    "failure-strategy",
    "dead-letter-queue.topic",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub outgoing: BTreeMap<String, OutgoingConfig>,
    #[serde(default)]
    pub incoming: BTreeMap<String, IncomingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutgoingConfig {
    pub topic: Option<String>,
    #[serde(default = "default_key_serializer")]
    pub key_serializer: String,
    pub value_serializer: Option<String>,
    pub client_id: Option<String>,
    pub client_id_prefix: Option<String>,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default)]
    pub lazy_client: bool,
    pub transactional_id: Option<String>,
    pub key_serialization_failure_handler: Option<String>,
    pub value_serialization_failure_handler: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IncomingConfig {
    pub topic: String,
    pub group_id: String,
    #[serde(default)]
    pub commit_strategy: CommitStrategy,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    pub dead_letter_topic: Option<String>,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Everything the producer lifecycle manager needs for one channel.
///
/// `properties` is the flat key/value map described by the channel
/// configuration: Kafka client properties plus the `key.serializer` /
/// `value.serializer` identifiers. Connector-only keys are stripped by
/// [`client_properties`] before the map reaches the Kafka client.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub channel: String,
    pub properties: BTreeMap<String, String>,
    pub close_timeout: Duration,
    pub operation_timeout: Duration,
    pub lazy_client: bool,
    pub key_serialization_failure_handler: Option<String>,
    pub value_serialization_failure_handler: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("KAFKA_CHANNELS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn outgoing_channel(&self, channel: &str) -> Result<&OutgoingConfig> {
        self.outgoing
            .get(channel)
            .ok_or_else(|| Error::Config(format!("No outgoing channel named '{}'", channel)))
    }

    pub fn incoming_channel(&self, channel: &str) -> Result<&IncomingConfig> {
        self.incoming
            .get(channel)
            .ok_or_else(|| Error::Config(format!("No incoming channel named '{}'", channel)))
    }

    pub fn producer_options(&self, channel: &str) -> Result<ProducerOptions> {
        let outgoing = self.outgoing_channel(channel)?;
        Ok(ProducerOptions::from_config(channel, &self.kafka, outgoing))
    }
}

impl KafkaConfig {
    pub fn bootstrap(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
        }
    }
}

impl IncomingConfig {
    pub fn dead_letter_topic(&self, channel: &str) -> String {
        self.dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("dead-letter-topic-{}", channel))
    }

    /// Consumer properties. Offsets are committed by the acknowledgment
    /// engine, so auto-commit is always disabled.
    pub fn consumer_properties(&self, kafka: &KafkaConfig) -> BTreeMap<String, String> {
        let mut map = self.properties.clone();
        map.entry(BOOTSTRAP_SERVERS.to_string())
            .or_insert_with(|| kafka.bootstrap());
        map.insert("group.id".to_string(), self.group_id.clone());
        map.insert("enable.auto.commit".to_string(), "false".to_string());
        map.insert("auto.offset.reset".to_string(), self.auto_offset_reset.clone());
        map.entry("enable.partition.eof".to_string())
            .or_insert_with(|| "false".to_string());
        client_properties(&map)
    }

    /// Options of the producer writing to the dead-letter topic. Records
    /// are forwarded as raw bytes.
    pub fn dead_letter_producer(&self, channel: &str, kafka: &KafkaConfig) -> ProducerOptions {
        let mut options = ProducerOptions::new(format!("{}-dead-letter-queue", channel))
            .property(BOOTSTRAP_SERVERS, kafka.bootstrap())
            .property(KEY_SERIALIZER, "bytes")
            .property(VALUE_SERIALIZER, "bytes")
            .property(CLIENT_ID, format!("kafka-dead-letter-topic-producer-{}", channel))
            .property(ACKS, "all")
            .lazy(true);
        for (key, value) in &self.properties {
            if key.starts_with("security.") || key.starts_with("sasl.") || key.starts_with("ssl.") {
                options = options.property(key, value);
            }
        }
        options
    }
}

impl ProducerOptions {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            properties: BTreeMap::new(),
            close_timeout: Duration::from_millis(default_close_timeout_ms()),
            operation_timeout: Duration::from_millis(default_operation_timeout_ms()),
            lazy_client: false,
            key_serialization_failure_handler: None,
            value_serialization_failure_handler: None,
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn lazy(mut self, lazy_client: bool) -> Self {
        self.lazy_client = lazy_client;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Resolves an outgoing channel into producer options.
    pub fn from_config(channel: &str, kafka: &KafkaConfig, outgoing: &OutgoingConfig) -> Self {
        let mut map = outgoing.properties.clone();

        // Acks must be a string, even when "1".
        map.insert(ACKS.to_string(), outgoing.acks.clone());

        if !map.contains_key(BOOTSTRAP_SERVERS) {
            info!(
                channel = %channel,
                "Setting {} to {}",
                BOOTSTRAP_SERVERS,
                kafka.bootstrap()
            );
            map.insert(BOOTSTRAP_SERVERS.to_string(), kafka.bootstrap());
        }

        if !map.contains_key(KEY_SERIALIZER) {
            debug!(channel = %channel, "Key serializer omitted, using {}", outgoing.key_serializer);
            map.insert(KEY_SERIALIZER.to_string(), outgoing.key_serializer.clone());
        }

        if let Some(value_serializer) = &outgoing.value_serializer {
            map.entry(VALUE_SERIALIZER.to_string())
                .or_insert_with(|| value_serializer.clone());
        }

        // Without a configured client id the prefix defaults to "kafka-producer-",
        // with one it defaults to "".
        let configured = outgoing.client_id.clone().or_else(|| map.get(CLIENT_ID).cloned());
        let client_id = match configured {
            None => format!(
                "{}{}",
                outgoing.client_id_prefix.as_deref().unwrap_or("kafka-producer-"),
                channel
            ),
            Some(id) => format!("{}{}", outgoing.client_id_prefix.as_deref().unwrap_or(""), id),
        };
        map.insert(CLIENT_ID.to_string(), client_id);

        // Avoids high load on disconnection.
        map.entry(RECONNECT_BACKOFF_MAX_MS.to_string())
            .or_insert_with(|| "10000".to_string());

        if let Some(transactional_id) = &outgoing.transactional_id {
            map.insert(TRANSACTIONAL_ID.to_string(), transactional_id.clone());
        }

        Self {
            channel: channel.to_string(),
            properties: map,
            close_timeout: Duration::from_millis(outgoing.close_timeout_ms),
            operation_timeout: Duration::from_millis(outgoing.operation_timeout_ms),
            lazy_client: outgoing.lazy_client,
            key_serialization_failure_handler: outgoing.key_serialization_failure_handler.clone(),
            value_serialization_failure_handler: outgoing
                .value_serialization_failure_handler
                .clone(),
        }
    }

    pub fn client_id(&self) -> &str {
        self.properties.get(CLIENT_ID).map(String::as_str).unwrap_or("")
    }

    pub fn is_transactional(&self) -> bool {
        self.properties.contains_key(TRANSACTIONAL_ID)
    }
}

/// Removes the connector-only keys, leaving what the Kafka client accepts.
pub fn client_properties(properties: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    properties
        .iter()
        .filter(|(key, _)| !CONNECTOR_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_key_serializer() -> String {
    "string".to_string()
}

fn default_acks() -> String {
    "1".to_string()
}

fn default_close_timeout_ms() -> u64 {
    10_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}
