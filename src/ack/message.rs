use crate::ack::engine::AckEngine;
use crate::error::ProcessingFailure;
use crate::types::{RecordHeader, TopicPartition};
use crate::Result;
use rdkafka::message::{Headers, Message};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A consumed record, detached from the Kafka client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: Option<i64>,
}

impl ConsumedRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| RecordHeader {
                        key: h.key.to_string(),
                        value: h.value.map(<[u8]>::to_vec),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Shared by a message and every message derived from it with
/// [`IncomingMessage::with_payload`].
struct Acknowledgment {
    resolved: AtomicBool,
    record: ConsumedRecord,
    engine: Arc<AckEngine>,
}

impl Acknowledgment {
    fn claim(&self) -> bool {
        let first = !self.resolved.swap(true, Ordering::AcqRel);
        if !first {
            debug!(
                topic = %self.record.topic,
                partition = self.record.partition,
                offset = self.record.offset,
                "Message already acknowledged"
            );
        }
        first
    }
}

/// A consumed message with its ack/nack capability.
///
/// Only the first `ack` or `nack` has an effect; later calls return `Ok(())`.
pub struct IncomingMessage<T = Option<Vec<u8>>> {
    payload: T,
    ack: Arc<Acknowledgment>,
}

impl IncomingMessage {
    pub(crate) fn new(record: ConsumedRecord, engine: Arc<AckEngine>) -> Self {
        Self {
            payload: record.payload.clone(),
            ack: Arc::new(Acknowledgment {
                resolved: AtomicBool::new(false),
                record,
                engine,
            }),
        }
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_deref().and_then(|p| std::str::from_utf8(p).ok())
    }
}

impl<T> IncomingMessage<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn record(&self) -> &ConsumedRecord {
        &self.ack.record
    }

    /// Replaces the payload, keeping the ack/nack capability of the
    /// original message.
    pub fn with_payload<U>(self, payload: U) -> IncomingMessage<U> {
        IncomingMessage {
            payload,
            ack: self.ack,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.ack.resolved.load(Ordering::Acquire)
    }

    /// Marks the message as processed.
    pub async fn ack(&self) -> Result<()> {
        if !self.ack.claim() {
            return Ok(());
        }
        self.ack.engine.ack(&self.ack.record).await
    }

    /// Rejects the message. What happens next depends on the channel's
    /// failure strategy; under `fail` this returns [`crate::Error::Halted`].
    pub async fn nack(
        &self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Result<()> {
        if !self.ack.claim() {
            return Ok(());
        }
        let cause: Box<dyn std::error::Error + Send + Sync> = cause.into();
        let cause: ProcessingFailure = Arc::from(cause);
        self.ack.engine.nack(&self.ack.record, cause).await
    }
}

impl<T: fmt::Debug> fmt::Debug for IncomingMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("payload", &self.payload)
            .field("topic", &self.ack.record.topic)
            .field("partition", &self.ack.record.partition)
            .field("offset", &self.ack.record.offset)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
