pub mod commit;
pub mod consumer;
pub mod engine;
pub mod failure;
pub mod message;

pub use commit::{CommitStrategy, CommitTracker};
pub use consumer::{IncomingChannel, KafkaConsumerChannel, KafkaOffsetCommitter, OffsetCommitter};
pub use engine::AckEngine;
pub use failure::{DeadLetterSink, FailureStrategy, KafkaDeadLetterSink};
pub use message::{ConsumedRecord, IncomingMessage, MessageMetadata};
