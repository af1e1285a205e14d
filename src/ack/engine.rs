//! Acknowledgment engine of an incoming channel.
//!
//! Every message handed to the application is registered with the engine.
//! Acks and handled nacks resolve the message's offset; the commit strategy
//! then decides whether the commit position of its partition moves. Under
//! the `fail` strategy the first nack halts the channel: nothing more is
//! registered and commits stop.

use crate::ack::commit::{CommitStrategy, CommitTracker};
use crate::ack::consumer::OffsetCommitter;
use crate::ack::failure::{DeadLetterSink, FailureStrategy};
use crate::ack::message::{ConsumedRecord, IncomingMessage};
use crate::error::ProcessingFailure;
use crate::observe::Observers;
use crate::types::{OffsetMap, TopicPartition};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct AckEngine {
    channel: String,
    failure_strategy: FailureStrategy,
    tracker: Mutex<CommitTracker>,
    committer: Arc<dyn OffsetCommitter>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    halted: watch::Sender<bool>,
    observers: Observers,
}

impl AckEngine {
    /// A dead-letter sink is required by, and only used with,
    /// [`FailureStrategy::DeadLetterQueue`].
    pub fn new(
        channel: impl Into<String>,
        commit_strategy: CommitStrategy,
        failure_strategy: FailureStrategy,
        committer: Arc<dyn OffsetCommitter>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
        observers: Observers,
    ) -> Result<Arc<Self>> {
        let channel = channel.into();
        if failure_strategy == FailureStrategy::DeadLetterQueue && dead_letter.is_none() {
            return Err(Error::Config(format!(
                "Channel '{}' uses the dead-letter-queue failure strategy without a dead-letter sink",
                channel
            )));
        }

        info!(
            channel = %channel,
            commit_strategy = ?commit_strategy,
            failure_strategy = failure_strategy.name(),
            "Acknowledgment engine ready"
        );

        let (halted, _) = watch::channel(false);
        Ok(Arc::new(Self {
            channel,
            failure_strategy,
            tracker: Mutex::new(CommitTracker::new(commit_strategy)),
            committer,
            dead_letter,
            halted,
            observers,
        }))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn failure_strategy(&self) -> FailureStrategy {
        self.failure_strategy
    }

    pub fn commit_strategy(&self) -> CommitStrategy {
        self.tracker.lock().strategy()
    }

    /// Wraps a consumed record for the application. Returns `None` once the
    /// channel is halted.
    pub fn register(self: &Arc<Self>, record: ConsumedRecord) -> Option<IncomingMessage> {
        if self.is_halted() {
            debug!(
                channel = %self.channel,
                offset = record.offset,
                "Channel halted, dropping record"
            );
            return None;
        }
        self.tracker
            .lock()
            .received(&record.topic_partition(), record.offset);
        Some(IncomingMessage::new(record, Arc::clone(self)))
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.borrow()
    }

    /// Resolves when the channel halts.
    pub(crate) fn halted(&self) -> watch::Receiver<bool> {
        self.halted.subscribe()
    }

    /// Last commit position handed to the committer.
    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.tracker.lock().committed(partition)
    }

    /// Registered messages not yet resolved.
    pub fn pending(&self, partition: &TopicPartition) -> usize {
        self.tracker.lock().pending(partition)
    }

    pub(crate) async fn ack(&self, record: &ConsumedRecord) -> Result<()> {
        self.observers.channel.on_ack(&self.channel, &record.metadata());
        self.resolve(record)
    }

    pub(crate) async fn nack(
        &self,
        record: &ConsumedRecord,
        cause: ProcessingFailure,
    ) -> Result<()> {
        self.observers
            .channel
            .on_nack(&self.channel, &record.metadata(), &cause);

        match self.failure_strategy {
            FailureStrategy::Fail => {
                error!(
                    channel = %self.channel,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    cause = %cause,
                    "Message nacked with the fail strategy"
                );
                self.halt(&Error::Processing(cause));
                Err(Error::Halted {
                    channel: self.channel.clone(),
                })
            }
            FailureStrategy::Ignore => {
                warn!(
                    channel = %self.channel,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    cause = %cause,
                    "Message nacked, ignoring"
                );
                self.resolve(record)
            }
            FailureStrategy::DeadLetterQueue => {
                let Some(sink) = &self.dead_letter else {
                    return Err(Error::Config(format!(
                        "No dead-letter sink for channel '{}'",
                        self.channel
                    )));
                };
                match sink.forward(record, &cause).await {
                    Ok(()) => self.resolve(record),
                    Err(e) => {
                        error!(
                            channel = %self.channel,
                            offset = record.offset,
                            error = %e,
                            "Unable to forward message to the dead-letter topic"
                        );
                        let err = Error::DeadLetter {
                            channel: self.channel.clone(),
                            source: Box::new(e),
                        };
                        self.halt(&err);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Stops the channel and reports `cause` to the failure observer.
    /// Only the first halt is reported.
    pub fn halt(&self, cause: &Error) {
        if !self.halted.send_replace(true) {
            error!(channel = %self.channel, error = %cause, "Channel halted");
            self.observers.report_failure(cause);
        }
    }

    fn resolve(&self, record: &ConsumedRecord) -> Result<()> {
        if self.is_halted() {
            debug!(
                channel = %self.channel,
                offset = record.offset,
                "Channel halted, offset not committed"
            );
            return Ok(());
        }

        let partition = record.topic_partition();
        let mut tracker = self.tracker.lock();
        match tracker.resolved(&partition, record.offset) {
            Some(position) => self.commit(&mut tracker, OffsetMap::from([(partition, position)])),
            None => Ok(()),
        }
    }

    /// Commits every position that is eligible but was not accepted yet,
    /// for instance after a failed commit. Does nothing once halted.
    pub fn commit_pending(&self) -> Result<()> {
        if self.is_halted() {
            return Ok(());
        }
        let mut tracker = self.tracker.lock();
        let offsets = tracker.uncommitted();
        if offsets.is_empty() {
            return Ok(());
        }
        self.commit(&mut tracker, offsets)
    }

    /// Runs under the tracker lock, so positions reach the committer in order.
    fn commit(&self, tracker: &mut CommitTracker, offsets: OffsetMap) -> Result<()> {
        if let Err(e) = self.committer.commit(&offsets) {
            warn!(channel = %self.channel, error = %e, "Unable to commit offsets");
            return Err(e);
        }
        for (partition, position) in &offsets {
            tracker.committed_to(partition, *position);
            debug!(
                channel = %self.channel,
                topic = %partition.topic,
                partition = partition.partition,
                position = *position,
                "Offsets committed"
            );
        }
        Ok(())
    }
}
