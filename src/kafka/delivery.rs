//! Sends and transactional operations of an outgoing channel.

use crate::kafka::lifecycle::ProducerManager;
use crate::kafka::producer::{BrokerProducer, PartitionInfo, ProducerFactory, RecordMetadata};
use crate::kafka::serializer::Payload;
use crate::types::{OffsetMap, RecordHeader};
use crate::{Error, Result};
use std::future::Future;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A record to write. Immutable once handed to [`ProducerManager::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Payload>,
    pub payload: Option<Payload>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: Option<i64>,
}

impl OutgoingRecord {
    pub fn to(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            payload: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn key(mut self, key: impl Into<Payload>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl<F: ProducerFactory> ProducerManager<F> {
    /// Writes a record and resolves with the broker acknowledgment.
    ///
    /// Resolves exactly once. Broker failures are returned as reported by
    /// the client; nothing is retried here.
    pub fn send(
        &self,
        record: OutgoingRecord,
    ) -> impl Future<Output = Result<RecordMetadata>> + Send + 'static {
        let channel = self.channel().to_string();
        let topic = record.topic.clone();
        let observer = self.observers.channel.clone();

        let queued = self.submit(move |inner| {
            let producer = inner.handle()?;
            let serialized = inner.serialize(record)?;
            let (tx, rx) = oneshot::channel::<Result<RecordMetadata>>();
            producer.send(
                serialized,
                Box::new(move |result: Result<RecordMetadata>| {
                    let _ = tx.send(result);
                }),
            );
            Ok(rx)
        });

        async move {
            let outcome = match queued.await {
                Ok(delivered) => delivered.await.unwrap_or_else(|_| {
                    Err(Error::Closed {
                        channel: channel.clone(),
                    })
                }),
                Err(e) => Err(e),
            };
            let outcome = outcome.and_then(|metadata| {
                if metadata.topic == topic {
                    Ok(metadata)
                } else {
                    Err(Error::TopicMismatch {
                        expected: topic.clone(),
                        actual: metadata.topic,
                    })
                }
            });

            match &outcome {
                Ok(metadata) => observer.on_sent(&channel, metadata),
                Err(e) => {
                    warn!(
                        channel = %channel,
                        topic = %topic,
                        error = %e,
                        "Unable to write to Kafka"
                    );
                    observer.on_send_failed(&channel, &topic, e);
                }
            }
            outcome
        }
    }

    pub fn flush(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.submit(|inner| inner.handle()?.flush(inner.operation_timeout))
    }

    pub fn partitions_for(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Vec<PartitionInfo>>> + Send + 'static {
        let topic = topic.to_string();
        self.submit(move |inner| inner.handle()?.partitions_for(&topic, inner.operation_timeout))
    }

    /// Transactional channels already run this while creating the producer.
    pub fn init_transactions(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.submit(|inner| inner.handle()?.init_transactions(inner.operation_timeout))
    }

    pub fn begin_transaction(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.run_on_sending_thread(|producer| producer.begin_transaction())
    }

    pub fn commit_transaction(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.submit(|inner| inner.handle()?.commit_transaction(inner.operation_timeout))
    }

    pub fn abort_transaction(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let channel = self.channel().to_string();
        self.submit(move |inner| {
            inner.handle()?.abort_transaction(inner.operation_timeout)?;
            info!(channel = %channel, "Transaction aborted");
            Ok(())
        })
    }

    /// Adds consumed offsets to the current transaction.
    pub fn send_offsets_to_transaction(
        &self,
        offsets: OffsetMap,
        group: <F::Producer as BrokerProducer>::GroupMetadata,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.submit(move |inner| {
            inner
                .handle()?
                .send_offsets_to_transaction(&offsets, &group, inner.operation_timeout)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, ProducerOptions};
    use crate::kafka::failure_handler::{from_fn, HandlerRegistry};
    use crate::observe::{ChannelObserver, Observers};
    use crate::test_utils::{MockFactory, MockProducer};
    use crate::types::TopicPartition;
    use parking_lot::Mutex;
    use rdkafka::error::KafkaError;
    use rdkafka::types::RDKafkaErrorCode;
    use std::sync::Arc;

    fn manager(factory: MockFactory) -> ProducerManager<MockFactory> {
        manager_with(factory, Observers::default(), &HandlerRegistry::new())
    }

    fn manager_with(
        factory: MockFactory,
        observers: Observers,
        handlers: &HandlerRegistry,
    ) -> ProducerManager<MockFactory> {
        let options = ProducerOptions::new("orders-out")
            .property(config::KEY_SERIALIZER, "string")
            .property(config::VALUE_SERIALIZER, "json")
            .lazy(true);
        ProducerManager::new(options, factory, handlers, observers).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<i64>>,
        failed: Mutex<Vec<String>>,
    }

    impl ChannelObserver for Arc<Recorder> {
        fn on_sent(&self, _channel: &str, metadata: &RecordMetadata) {
            self.sent.lock().push(metadata.offset);
        }

        fn on_send_failed(&self, channel: &str, topic: &str, _error: &Error) {
            self.failed.lock().push(format!("{}/{}", channel, topic));
        }
    }

    #[tokio::test]
    async fn test_send_resolves_with_metadata() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        let metadata = manager
            .send(OutgoingRecord::to("orders").key("k1").payload(serde_json::json!({"id": 1})))
            .await
            .unwrap();
        assert_eq!(metadata.topic, "orders");
        assert_eq!(metadata.offset, 0);

        let records = factory.producer().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some(&b"k1"[..]));
        assert_eq!(records[0].value.as_deref(), Some(&br#"{"id":1}"#[..]));
    }

    #[tokio::test]
    async fn test_broker_failure_is_returned_raw_and_observed() {
        let raw = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        let factory = MockFactory::new().with_producer(MockProducer::new().fail_sends(raw.clone()));
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(
            factory,
            Observers::default().with_channel(Arc::clone(&recorder)),
            &HandlerRegistry::new(),
        );

        let err = manager
            .send(OutgoingRecord::to("orders").payload("x"))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Kafka(e) if *e == raw));
        assert_eq!(*recorder.failed.lock(), vec!["orders-out/orders".to_string()]);
        assert!(recorder.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_topic_mismatch_is_an_error() {
        let factory =
            MockFactory::new().with_producer(MockProducer::new().redirect_to("elsewhere"));
        let manager = manager(factory);

        match manager.send(OutgoingRecord::to("orders").payload("x")).await {
            Err(Error::TopicMismatch { expected, actual }) => {
                assert_eq!(expected, "orders");
                assert_eq!(actual, "elsewhere");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serialization_failure_uses_handler() {
        let factory = MockFactory::new();
        let mut handlers = HandlerRegistry::new();
        handlers.register("null-key", from_fn(|_| Ok(None)));

        let options = ProducerOptions {
            key_serialization_failure_handler: Some("null-key".to_string()),
            ..ProducerOptions::new("orders-out")
                .property(config::KEY_SERIALIZER, "int")
                .property(config::VALUE_SERIALIZER, "string")
                .lazy(true)
        };
        let manager =
            ProducerManager::new(options, factory.clone(), &handlers, Observers::default())
                .unwrap();

        manager
            .send(OutgoingRecord::to("orders").key("not-a-number").payload("v"))
            .await
            .unwrap();
        assert_eq!(factory.producer().records()[0].key, None);
    }

    #[tokio::test]
    async fn test_serialization_failure_without_handler() {
        let manager = manager(MockFactory::new());
        let err = manager
            .send(OutgoingRecord::to("orders").payload(vec![0u8, 1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encode { target: "value", .. }));
    }

    #[tokio::test]
    async fn test_operations_run_in_submission_order() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        let begin = manager.begin_transaction();
        let send = manager.send(OutgoingRecord::to("orders").payload("x"));
        let offsets = manager.send_offsets_to_transaction(
            OffsetMap::from([(TopicPartition::new("orders", 0), 5)]),
            "group".to_string(),
        );
        let commit = manager.commit_transaction();
        let flush = manager.flush();

        // Awaited in reverse; the sending thread still runs them in order.
        flush.await.unwrap();
        commit.await.unwrap();
        offsets.await.unwrap();
        send.await.unwrap();
        begin.await.unwrap();

        assert_eq!(
            factory.producer().operations(),
            vec![
                "begin_transaction",
                "send:orders",
                "send_offsets_to_transaction:orders-0=5",
                "commit_transaction",
                "flush",
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_and_partitions() {
        let manager = manager(MockFactory::new());
        manager.begin_transaction().await.unwrap();
        manager.abort_transaction().await.unwrap();

        let partitions = manager.partitions_for("orders").await.unwrap();
        assert_eq!(partitions.len(), 3);
        assert!(partitions.iter().all(|p| p.topic == "orders"));
    }
}
