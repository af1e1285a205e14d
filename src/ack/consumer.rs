use crate::ack::engine::AckEngine;
use crate::ack::failure::{DeadLetterSink, FailureStrategy, KafkaDeadLetterSink};
use crate::ack::message::{ConsumedRecord, IncomingMessage};
use crate::config::Config;
use crate::observe::Observers;
use crate::types::OffsetMap;
use crate::Result;
use futures::{Stream, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use tracing::{info, warn};

/// Writes commit positions to the broker.
pub trait OffsetCommitter: Send + Sync {
    /// Must not block; the engine calls it while holding its commit lock.
    fn commit(&self, offsets: &OffsetMap) -> Result<()>;
}

/// Commits asynchronously through an rdkafka consumer.
pub struct KafkaOffsetCommitter {
    consumer: Arc<StreamConsumer>,
}

impl KafkaOffsetCommitter {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        Self { consumer }
    }
}

impl OffsetCommitter for KafkaOffsetCommitter {
    fn commit(&self, offsets: &OffsetMap) -> Result<()> {
        let mut list = TopicPartitionList::with_capacity(offsets.len());
        for (tp, position) in offsets {
            list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*position))?;
        }
        self.consumer.commit(&list, CommitMode::Async)?;
        Ok(())
    }
}

/// Adapts consumed records into acknowledgeable messages.
#[derive(Clone)]
pub struct IncomingChannel {
    engine: Arc<AckEngine>,
}

impl IncomingChannel {
    pub fn new(engine: Arc<AckEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<AckEngine> {
        &self.engine
    }

    /// Registers each record with the engine. The stream ends when `records`
    /// does or when the channel halts, even while waiting for a record.
    pub fn messages<S>(&self, records: S) -> impl Stream<Item = IncomingMessage> + Send + 'static
    where
        S: Stream<Item = ConsumedRecord> + Send + Unpin + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let halted = engine.halted();

        futures::stream::unfold(
            (records, halted, engine),
            |(mut records, mut halted, engine)| async move {
                if *halted.borrow() {
                    return None;
                }
                let record = tokio::select! {
                    biased;
                    _ = halted.wait_for(|h| *h) => return None,
                    record = records.next() => record?,
                };
                let message = engine.register(record)?;
                Some((message, (records, halted, engine)))
            },
        )
    }
}

/// An incoming channel reading from Kafka.
pub struct KafkaConsumerChannel {
    channel: String,
    consumer: Arc<StreamConsumer>,
    incoming: IncomingChannel,
    dead_letter: Option<Arc<KafkaDeadLetterSink>>,
}

impl KafkaConsumerChannel {
    /// Builds the consumer and its acknowledgment engine, and subscribes to
    /// the channel's topic.
    pub fn from_config(channel: &str, config: &Config, observers: Observers) -> Result<Self> {
        let incoming = config.incoming_channel(channel)?;

        let mut client = ClientConfig::new();
        for (key, value) in incoming.consumer_properties(&config.kafka) {
            client.set(key, value);
        }
        let consumer: Arc<StreamConsumer> = Arc::new(client.create()?);
        consumer.subscribe(&[incoming.topic.as_str()])?;

        let dead_letter = match incoming.failure_strategy {
            FailureStrategy::DeadLetterQueue => Some(Arc::new(KafkaDeadLetterSink::from_config(
                channel,
                incoming,
                &config.kafka,
            )?)),
            _ => None,
        };

        let engine = AckEngine::new(
            channel,
            incoming.commit_strategy,
            incoming.failure_strategy,
            Arc::new(KafkaOffsetCommitter::new(Arc::clone(&consumer))),
            dead_letter
                .clone()
                .map(|sink| sink as Arc<dyn DeadLetterSink>),
            observers,
        )?;

        info!(
            channel = %channel,
            topic = %incoming.topic,
            group_id = %incoming.group_id,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            channel: channel.to_string(),
            consumer,
            incoming: IncomingChannel::new(engine),
            dead_letter,
        })
    }

    pub fn engine(&self) -> &Arc<AckEngine> {
        self.incoming.engine()
    }

    /// Consumed records, detached from the client. Receive errors are
    /// logged and skipped.
    pub fn records(&self) -> impl Stream<Item = ConsumedRecord> + Send + 'static {
        let consumer = Arc::clone(&self.consumer);
        let channel = self.channel.clone();

        futures::stream::unfold(consumer, move |consumer| {
            let channel = channel.clone();
            async move {
                loop {
                    let received = consumer
                        .recv()
                        .await
                        .map(|message| ConsumedRecord::from_message(&message));
                    match received {
                        Ok(record) => return Some((record, consumer)),
                        Err(e) => warn!(channel = %channel, error = %e, "Kafka receive error"),
                    }
                }
            }
        })
    }

    pub fn messages(&self) -> impl Stream<Item = IncomingMessage> + Send + 'static {
        self.incoming.messages(Box::pin(self.records()))
    }

    /// Retries outstanding commits and closes the dead-letter producer, if any.
    pub async fn close(&self) {
        if let Err(e) = self.engine().commit_pending() {
            warn!(channel = %self.channel, error = %e, "Unable to commit offsets on close");
        }
        if let Some(sink) = &self.dead_letter {
            sink.producer().close_async().await;
        }
        info!(channel = %self.channel, "Incoming channel closed");
    }
}
