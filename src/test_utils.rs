//! In-memory stand-ins for the broker, used by unit and integration tests.

use crate::ack::{ConsumedRecord, DeadLetterSink, OffsetCommitter};
use crate::error::ProcessingFailure;
use crate::kafka::{
    BrokerProducer, PartitionInfo, ProducerFactory, RecordMetadata, SerializedRecord,
};
use crate::kafka::producer::DeliveryCallback;
use crate::types::{OffsetMap, TopicPartition};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct MockProducerBehavior {
    send_error: Option<KafkaError>,
    redirect_to: Option<String>,
    fail_init_transactions: bool,
    close_delay: Duration,
}

#[derive(Debug, Default)]
struct MockProducerLog {
    operations: Mutex<Vec<String>>,
    records: Mutex<Vec<SerializedRecord>>,
    next_offset: AtomicI64,
    close_calls: AtomicUsize,
}

/// A broker producer recording every operation. Clones share their log.
#[derive(Debug, Clone, Default)]
pub struct MockProducer {
    behavior: MockProducerBehavior,
    log: Arc<MockProducerLog>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send resolves with `error`.
    pub fn fail_sends(mut self, error: KafkaError) -> Self {
        self.behavior.send_error = Some(error);
        self
    }

    /// Acknowledges every record on `topic` instead of the requested one.
    pub fn redirect_to(mut self, topic: &str) -> Self {
        self.behavior.redirect_to = Some(topic.to_string());
        self
    }

    pub fn fail_init_transactions(mut self) -> Self {
        self.behavior.fail_init_transactions = true;
        self
    }

    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.behavior.close_delay = delay;
        self
    }

    pub fn operations(&self) -> Vec<String> {
        self.log.operations.lock().clone()
    }

    pub fn records(&self) -> Vec<SerializedRecord> {
        self.log.records.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.log.close_calls.load(Ordering::SeqCst)
    }

    fn record_operation(&self, operation: impl Into<String>) {
        self.log.operations.lock().push(operation.into());
    }
}

impl BrokerProducer for MockProducer {
    type GroupMetadata = String;

    fn send(&self, record: SerializedRecord, callback: DeliveryCallback) {
        self.record_operation(format!("send:{}", record.topic));
        self.log.records.lock().push(record.clone());

        if let Some(error) = &self.behavior.send_error {
            callback(Err(Error::Kafka(error.clone())));
            return;
        }
        callback(Ok(RecordMetadata {
            topic: self.behavior.redirect_to.clone().unwrap_or(record.topic),
            partition: record.partition.unwrap_or(0),
            offset: self.log.next_offset.fetch_add(1, Ordering::SeqCst),
            timestamp: record.timestamp,
        }));
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        self.record_operation("flush");
        Ok(())
    }

    fn partitions_for(&self, topic: &str, _timeout: Duration) -> Result<Vec<PartitionInfo>> {
        self.record_operation(format!("partitions_for:{}", topic));
        Ok((0..3)
            .map(|partition| PartitionInfo {
                topic: topic.to_string(),
                partition,
                leader: 1,
                replicas: vec![1],
                in_sync_replicas: vec![1],
            })
            .collect())
    }

    fn init_transactions(&self, _timeout: Duration) -> Result<()> {
        self.record_operation("init_transactions");
        if self.behavior.fail_init_transactions {
            return Err(Error::Kafka(KafkaError::ClientCreation(
                "transactions are not supported by the broker".to_string(),
            )));
        }
        Ok(())
    }

    fn begin_transaction(&self) -> Result<()> {
        self.record_operation("begin_transaction");
        Ok(())
    }

    fn commit_transaction(&self, _timeout: Duration) -> Result<()> {
        self.record_operation("commit_transaction");
        Ok(())
    }

    fn abort_transaction(&self, _timeout: Duration) -> Result<()> {
        self.record_operation("abort_transaction");
        Ok(())
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        _group: &String,
        _timeout: Duration,
    ) -> Result<()> {
        let offsets: Vec<_> = offsets
            .iter()
            .map(|(tp, position)| format!("{}={}", tp, position))
            .collect();
        self.record_operation(format!("send_offsets_to_transaction:{}", offsets.join(",")));
        Ok(())
    }

    fn close(&self, _timeout: Duration) {
        if !self.behavior.close_delay.is_zero() {
            thread::sleep(self.behavior.close_delay);
        }
        self.log.close_calls.fetch_add(1, Ordering::SeqCst);
        self.record_operation("close");
    }
}

#[derive(Debug, Default)]
struct MockFactoryState {
    attempts: AtomicUsize,
    created: AtomicUsize,
    failures_left: AtomicUsize,
    last_properties: Mutex<Option<BTreeMap<String, String>>>,
}

/// Hands out clones of one [`MockProducer`] and counts constructions.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    producer: MockProducer,
    creation_delay: Duration,
    state: Arc<MockFactoryState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The producer handed out, sharing its log with every construction.
    pub fn producer(&self) -> MockProducer {
        self.producer.clone()
    }

    pub fn with_producer(mut self, producer: MockProducer) -> Self {
        self.producer = producer;
        self
    }

    /// The next `count` constructions fail.
    pub fn fail_creation(self, count: usize) -> Self {
        self.state.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay = delay;
        self
    }

    /// Successful constructions.
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn last_properties(&self) -> Option<BTreeMap<String, String>> {
        self.state.last_properties.lock().clone()
    }
}

impl ProducerFactory for MockFactory {
    type Producer = MockProducer;

    fn create(
        &self,
        _channel: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<MockProducer> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        *self.state.last_properties.lock() = Some(properties.clone());
        if !self.creation_delay.is_zero() {
            thread::sleep(self.creation_delay);
        }

        let failing = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Kafka(KafkaError::ClientCreation(
                "broker unreachable".to_string(),
            )));
        }

        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.producer.clone())
    }
}

/// Records every commit.
#[derive(Debug, Clone, Default)]
pub struct MockCommitter {
    commits: Arc<Mutex<Vec<OffsetMap>>>,
    failures_left: Arc<AtomicUsize>,
}

impl MockCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self) -> Self {
        self.fail_times(usize::MAX)
    }

    /// Rejects the next `count` commits.
    pub fn fail_times(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Committed positions in commit order.
    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        self.commits
            .lock()
            .iter()
            .flat_map(|offsets| offsets.iter().map(|(tp, position)| (tp.clone(), *position)))
            .collect()
    }

    /// Latest position committed for `partition`.
    pub fn position(&self, partition: &TopicPartition) -> Option<i64> {
        self.commits()
            .into_iter()
            .filter(|(tp, _)| tp == partition)
            .map(|(_, position)| position)
            .last()
    }
}

impl OffsetCommitter for MockCommitter {
    fn commit(&self, offsets: &OffsetMap) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Kafka(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RebalanceInProgress,
            )));
        }
        self.commits.lock().push(offsets.clone());
        Ok(())
    }
}

/// Dead-letter sink keeping forwarded records in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingDeadLetterSink {
    forwarded: Arc<Mutex<Vec<(ConsumedRecord, String)>>>,
    failing: bool,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Forwarded records with their failure description.
    pub fn forwarded(&self) -> Vec<(ConsumedRecord, String)> {
        self.forwarded.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn forward(&self, record: &ConsumedRecord, cause: &ProcessingFailure) -> Result<()> {
        if self.failing {
            return Err(Error::Kafka(KafkaError::MessageProduction(
                RDKafkaErrorCode::MessageTimedOut,
            )));
        }
        self.forwarded.lock().push((record.clone(), cause.to_string()));
        Ok(())
    }
}
