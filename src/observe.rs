//! Side-effecting observers invoked by the producer and the acknowledgment
//! engine. Implementations are shared between channels and must not block.

use crate::ack::MessageMetadata;
use crate::error::ProcessingFailure;
use crate::kafka::RecordMetadata;
use crate::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Receives producer initialization failures and fatal channel errors.
pub type FailureObserver = Arc<dyn Fn(&Error) + Send + Sync>;

/// Invoked once a channel's producer is ready, with the channel name and the
/// client properties it was built from.
pub type CreatedObserver = Arc<dyn Fn(&str, &BTreeMap<String, String>) + Send + Sync>;

/// Per-message notifications, for metrics or tracing.
#[allow(unused_variables)]
pub trait ChannelObserver: Send + Sync {
    fn on_sent(&self, channel: &str, metadata: &RecordMetadata) {}

    fn on_send_failed(&self, channel: &str, topic: &str, error: &Error) {}

    fn on_ack(&self, channel: &str, message: &MessageMetadata) {}

    fn on_nack(&self, channel: &str, message: &MessageMetadata, cause: &ProcessingFailure) {}
}

/// Default observer, writing through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl ChannelObserver for LoggingObserver {
    fn on_sent(&self, channel: &str, metadata: &RecordMetadata) {
        trace!(
            channel = %channel,
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "Record written"
        );
    }

    fn on_ack(&self, channel: &str, message: &MessageMetadata) {
        trace!(
            channel = %channel,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Message acknowledged"
        );
    }

    fn on_nack(&self, channel: &str, message: &MessageMetadata, cause: &ProcessingFailure) {
        debug!(
            channel = %channel,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            cause = %cause,
            "Message rejected"
        );
    }
}

/// The observers attached to a channel.
#[derive(Clone)]
pub struct Observers {
    pub failure: Option<FailureObserver>,
    pub created: Option<CreatedObserver>,
    pub channel: Arc<dyn ChannelObserver>,
}

impl Observers {
    pub fn with_failure(mut self, observer: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.failure = Some(Arc::new(observer));
        self
    }

    pub fn with_created(
        mut self,
        observer: impl Fn(&str, &BTreeMap<String, String>) + Send + Sync + 'static,
    ) -> Self {
        self.created = Some(Arc::new(observer));
        self
    }

    pub fn with_channel(mut self, observer: impl ChannelObserver + 'static) -> Self {
        self.channel = Arc::new(observer);
        self
    }

    pub(crate) fn report_failure(&self, error: &Error) {
        if let Some(observer) = &self.failure {
            observer(error);
        }
    }

    pub(crate) fn report_created(&self, channel: &str, properties: &BTreeMap<String, String>) {
        if let Some(observer) = &self.created {
            observer(channel, properties);
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self {
            failure: None,
            created: None,
            channel: Arc::new(LoggingObserver),
        }
    }
}
