use crate::types::{OffsetMap, RecordHeader};
use crate::{Error, Result};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// A record whose key and value have been serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: Option<i64>,
}

/// Broker acknowledgment of a written record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub in_sync_replicas: Vec<i32>,
}

/// Invoked exactly once with the outcome of a send.
pub type DeliveryCallback = Box<dyn FnOnce(Result<RecordMetadata>) + Send + Sync + 'static>;

/// The operations of an underlying broker producer.
///
/// Implementations are not required to be safe for concurrent use: the
/// lifecycle manager only ever calls them from the channel's sending thread.
pub trait BrokerProducer: Send + Sync + 'static {
    /// Consumer group metadata accepted by
    /// [`send_offsets_to_transaction`](Self::send_offsets_to_transaction).
    type GroupMetadata: Send + 'static;

    /// Enqueues a record. `callback` must be invoked exactly once, including
    /// when the record is rejected before reaching the broker.
    fn send(&self, record: SerializedRecord, callback: DeliveryCallback);

    fn flush(&self, timeout: Duration) -> Result<()>;

    fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<PartitionInfo>>;

    fn init_transactions(&self, timeout: Duration) -> Result<()>;

    fn begin_transaction(&self) -> Result<()>;

    fn commit_transaction(&self, timeout: Duration) -> Result<()>;

    fn abort_transaction(&self, timeout: Duration) -> Result<()>;

    fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group: &Self::GroupMetadata,
        timeout: Duration,
    ) -> Result<()>;

    /// Waits up to `timeout` for outstanding records. The manager drops its
    /// only reference right after, which releases the client.
    fn close(&self, timeout: Duration);
}

/// Builds the broker producer of a channel from its client properties.
pub trait ProducerFactory: Send + Sync + 'static {
    type Producer: BrokerProducer;

    fn create(
        &self,
        channel: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Self::Producer>;
}

/// Routes delivery reports of the rdkafka producer to the per-record callback.
pub struct DeliveryContext {
    channel: String,
}

impl ClientContext for DeliveryContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(channel = %self.channel, error = %error, "Kafka client error: {}", reason);
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliveryCallback>;

    fn delivery(&self, result: &DeliveryResult<'_>, callback: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(message) => Ok(RecordMetadata {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                timestamp: message.timestamp().to_millis(),
            }),
            Err((error, _)) => Err(Error::Kafka(error.clone())),
        };
        callback(outcome);
    }
}

/// [`BrokerProducer`] backed by an rdkafka `ThreadedProducer`.
pub struct KafkaBrokerProducer {
    channel: String,
    inner: ThreadedProducer<DeliveryContext>,
}

impl BrokerProducer for KafkaBrokerProducer {
    type GroupMetadata = ConsumerGroupMetadata;

    fn send(&self, record: SerializedRecord, callback: DeliveryCallback) {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for header in &record.headers {
            headers = headers.insert(Header {
                key: &header.key,
                value: header.value.as_deref(),
            });
        }

        let mut base: BaseRecord<'_, [u8], [u8], Box<DeliveryCallback>> =
            BaseRecord::with_opaque_to(&record.topic, Box::new(callback)).headers(headers);
        if let Some(key) = record.key.as_deref() {
            base = base.key(key);
        }
        if let Some(value) = record.value.as_deref() {
            base = base.payload(value);
        }
        if let Some(partition) = record.partition {
            base = base.partition(partition);
        }
        if let Some(timestamp) = record.timestamp {
            base = base.timestamp(timestamp);
        }

        if let Err((error, rejected)) = self.inner.send(base) {
            (rejected.delivery_opaque)(Err(Error::Kafka(error)));
        }
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        Ok(self.inner.flush(timeout)?)
    }

    fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<PartitionInfo>> {
        let metadata = self.inner.client().fetch_metadata(Some(topic), timeout)?;

        let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Ok(Vec::new());
        };
        if let Some(error) = topic_metadata.error() {
            return Err(Error::Kafka(KafkaError::MetadataFetch(error.into())));
        }

        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|p| PartitionInfo {
                topic: topic.to_string(),
                partition: p.id(),
                leader: p.leader(),
                replicas: p.replicas().to_vec(),
                in_sync_replicas: p.isr().to_vec(),
            })
            .collect())
    }

    fn init_transactions(&self, timeout: Duration) -> Result<()> {
        Ok(self.inner.init_transactions(timeout)?)
    }

    fn begin_transaction(&self) -> Result<()> {
        Ok(self.inner.begin_transaction()?)
    }

    fn commit_transaction(&self, timeout: Duration) -> Result<()> {
        Ok(self.inner.commit_transaction(timeout)?)
    }

    fn abort_transaction(&self, timeout: Duration) -> Result<()> {
        Ok(self.inner.abort_transaction(timeout)?)
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group: &ConsumerGroupMetadata,
        timeout: Duration,
    ) -> Result<()> {
        let mut list = TopicPartitionList::new();
        for (tp, offset) in offsets {
            list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))?;
        }
        Ok(self
            .inner
            .send_offsets_to_transaction(&list, group, timeout)?)
    }

    fn close(&self, timeout: Duration) {
        if let Err(e) = self.inner.flush(timeout) {
            warn!(channel = %self.channel, error = %e, "Unable to flush producer before close");
        }
    }
}

/// Creates [`KafkaBrokerProducer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaProducerFactory;

impl ProducerFactory for KafkaProducerFactory {
    type Producer = KafkaBrokerProducer;

    fn create(
        &self,
        channel: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<KafkaBrokerProducer> {
        let mut config = ClientConfig::new();
        for (key, value) in properties {
            config.set(key, value);
        }

        let inner: ThreadedProducer<DeliveryContext> = config.create_with_context(DeliveryContext {
            channel: channel.to_string(),
        })?;

        info!(
            channel = %channel,
            client_id = properties.get("client.id").map(String::as_str).unwrap_or(""),
            "Kafka producer created"
        );

        Ok(KafkaBrokerProducer {
            channel: channel.to_string(),
            inner,
        })
    }
}
