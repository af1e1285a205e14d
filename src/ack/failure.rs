use crate::ack::message::ConsumedRecord;
use crate::config::{IncomingConfig, KafkaConfig};
use crate::error::ProcessingFailure;
use crate::kafka::{
    HandlerRegistry, KafkaProducerFactory, OutgoingRecord, ProducerFactory, ProducerManager,
};
use crate::observe::Observers;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEAD_LETTER_REASON: &str = "dead-letter-reason";
pub const DEAD_LETTER_CAUSE: &str = "dead-letter-cause";
pub const DEAD_LETTER_TOPIC: &str = "dead-letter-topic";
pub const DEAD_LETTER_PARTITION: &str = "dead-letter-partition";
pub const DEAD_LETTER_OFFSET: &str = "dead-letter-offset";

/// What happens to a rejected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStrategy {
    /// Halt the channel.
    #[default]
    Fail,
    /// Log and carry on as if acknowledged.
    Ignore,
    /// Forward to the dead-letter topic, then carry on as if acknowledged.
    DeadLetterQueue,
}

impl FailureStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FailureStrategy::Fail => "fail",
            FailureStrategy::Ignore => "ignore",
            FailureStrategy::DeadLetterQueue => "dead-letter-queue",
        }
    }
}

/// Receives messages rejected under [`FailureStrategy::DeadLetterQueue`].
///
/// Shared between channels; implementations must tolerate concurrent calls.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn forward(&self, record: &ConsumedRecord, cause: &ProcessingFailure) -> Result<()>;
}

/// Writes rejected messages to a Kafka topic, with the failure described
/// in `dead-letter-*` headers.
pub struct KafkaDeadLetterSink<F: ProducerFactory = KafkaProducerFactory> {
    topic: String,
    producer: ProducerManager<F>,
}

impl KafkaDeadLetterSink<KafkaProducerFactory> {
    pub fn from_config(
        channel: &str,
        incoming: &IncomingConfig,
        kafka: &KafkaConfig,
    ) -> Result<Self> {
        let options = incoming.dead_letter_producer(channel, kafka);
        let producer = ProducerManager::new(
            options,
            KafkaProducerFactory,
            &HandlerRegistry::new(),
            Observers::default(),
        )?;
        Ok(Self::new(incoming.dead_letter_topic(channel), producer))
    }
}

impl<F: ProducerFactory> KafkaDeadLetterSink<F> {
    /// `producer` must use the `bytes` key and value serializers.
    pub fn new(topic: impl Into<String>, producer: ProducerManager<F>) -> Self {
        Self {
            topic: topic.into(),
            producer,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn producer(&self) -> &ProducerManager<F> {
        &self.producer
    }

    fn dead_letter_record(
        &self,
        record: &ConsumedRecord,
        cause: &ProcessingFailure,
    ) -> OutgoingRecord {
        let mut outgoing = OutgoingRecord::to(self.topic.clone());
        if let Some(key) = &record.key {
            outgoing = outgoing.key(key.clone());
        }
        if let Some(payload) = &record.payload {
            outgoing = outgoing.payload(payload.clone());
        }
        outgoing.headers = record.headers.clone();

        let reason = cause.to_string();
        let root = root_cause(&**cause);
        outgoing
            .header(DEAD_LETTER_REASON, reason)
            .header(DEAD_LETTER_CAUSE, root)
            .header(DEAD_LETTER_TOPIC, record.topic.clone())
            .header(DEAD_LETTER_PARTITION, record.partition.to_string())
            .header(DEAD_LETTER_OFFSET, record.offset.to_string())
    }
}

#[async_trait]
impl<F: ProducerFactory> DeadLetterSink for KafkaDeadLetterSink<F> {
    async fn forward(&self, record: &ConsumedRecord, cause: &ProcessingFailure) -> Result<()> {
        let outgoing = self.dead_letter_record(record, cause);
        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            dead_letter_topic = %self.topic,
            "Forwarding message to the dead-letter topic"
        );
        self.producer.send(outgoing).await.map(|_| ())
    }
}

/// Description of the innermost error of the chain.
fn root_cause(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}
