#![allow(dead_code)]

use kafka_channels::ack::{
    AckEngine, ConsumedRecord, DeadLetterSink, IncomingChannel, IncomingMessage, MessageMetadata,
};
use kafka_channels::config::{self, ProducerOptions};
use kafka_channels::error::ProcessingFailure;
use kafka_channels::kafka::HandlerRegistry;
use kafka_channels::observe::{ChannelObserver, Observers};
use kafka_channels::test_utils::{MockCommitter, MockFactory, RecordingDeadLetterSink};
use kafka_channels::{CommitStrategy, Error, FailureStrategy, ProducerManager};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "letters";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_channels=debug")
        .try_init()
        .ok();
}

pub fn lazy_options(channel: &str) -> ProducerOptions {
    ProducerOptions::new(channel)
        .property(config::VALUE_SERIALIZER, "string")
        .property(config::CLIENT_ID, format!("kafka-producer-{}", channel))
        .lazy(true)
        .close_timeout(Duration::from_millis(500))
}

pub fn producer(channel: &str, factory: &MockFactory) -> ProducerManager<MockFactory> {
    ProducerManager::new(
        lazy_options(channel),
        factory.clone(),
        &HandlerRegistry::new(),
        Observers::default(),
    )
    .unwrap()
}

/// Records "a".."j" on one partition, offsets 0..10.
pub fn letters() -> Vec<ConsumedRecord> {
    ('a'..='j')
        .enumerate()
        .map(|(offset, letter)| {
            ConsumedRecord::new(TOPIC, 0, offset as i64).with_payload(letter.to_string())
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
#[error("cannot process '{0}'")]
pub struct Rejected(pub String);

/// Upper-cases the payload. "b" fails and "e" produces nothing.
pub fn process(payload: &str) -> Result<Option<String>, Rejected> {
    match payload {
        "b" => Err(Rejected(payload.to_string())),
        "e" => Ok(None),
        other => Ok(Some(other.to_uppercase())),
    }
}

/// Counts acks and nacks reported by the engine.
#[derive(Default)]
pub struct Counters {
    pub acked: AtomicUsize,
    pub nacked: AtomicUsize,
    pub nacked_offsets: Mutex<Vec<i64>>,
}

impl Counters {
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn nacked(&self) -> usize {
        self.nacked.load(Ordering::SeqCst)
    }
}

pub struct CountingObserver(pub Arc<Counters>);

impl ChannelObserver for CountingObserver {
    fn on_ack(&self, _channel: &str, _message: &MessageMetadata) {
        self.0.acked.fetch_add(1, Ordering::SeqCst);
    }

    fn on_nack(&self, _channel: &str, message: &MessageMetadata, _cause: &ProcessingFailure) {
        self.0.nacked.fetch_add(1, Ordering::SeqCst);
        self.0.nacked_offsets.lock().push(message.offset);
    }
}

/// An incoming channel wired to in-memory collaborators.
pub struct Pipeline {
    pub channel: IncomingChannel,
    pub committer: MockCommitter,
    pub dead_letter: RecordingDeadLetterSink,
    pub counters: Arc<Counters>,
    pub failures: Arc<Mutex<Vec<String>>>,
    pub sink: Vec<String>,
}

impl Pipeline {
    pub fn new(commit: CommitStrategy, failure: FailureStrategy) -> Self {
        Self::with_dead_letter(commit, failure, RecordingDeadLetterSink::new())
    }

    pub fn with_dead_letter(
        commit: CommitStrategy,
        failure: FailureStrategy,
        dead_letter: RecordingDeadLetterSink,
    ) -> Self {
        let committer = MockCommitter::new();
        let counters = Arc::new(Counters::default());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let reported = Arc::clone(&failures);
        let observers = Observers::default()
            .with_channel(CountingObserver(Arc::clone(&counters)))
            .with_failure(move |e| reported.lock().push(e.to_string()));

        let sink: Option<Arc<dyn DeadLetterSink>> = match failure {
            FailureStrategy::DeadLetterQueue => Some(Arc::new(dead_letter.clone())),
            _ => None,
        };
        let engine = AckEngine::new(
            "letters-in",
            commit,
            failure,
            Arc::new(committer.clone()),
            sink,
            observers,
        )
        .unwrap();

        Self {
            channel: IncomingChannel::new(engine),
            committer,
            dead_letter,
            counters,
            failures,
            sink: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Arc<AckEngine> {
        self.channel.engine()
    }

    /// Processes one message, writing its output to the sink.
    pub async fn handle(&mut self, message: IncomingMessage) -> kafka_channels::Result<()> {
        let payload = message.payload_str().unwrap_or_default().to_string();
        match process(&payload) {
            Ok(Some(output)) => {
                let message = message.with_payload(output.clone());
                self.sink.push(output);
                message.ack().await
            }
            Ok(None) => message.ack().await,
            Err(e) => message.nack(e).await,
        }
    }
}

pub fn is_halted(result: &kafka_channels::Result<()>) -> bool {
    matches!(result, Err(Error::Halted { .. }))
}
