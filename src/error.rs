//! Error types and result handling for kafka-channels.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use kafka_channels::{Error, Result};
//!
//! fn open_channel() -> Result<()> {
//!     Err(Error::MissingValueSerializer {
//!         channel: "orders".to_string(),
//!     })
//! }
//!
//! match open_channel() {
//!     Ok(()) => println!("Opened"),
//!     Err(Error::MissingValueSerializer { channel }) => eprintln!("Fix config of {}", channel),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::sync::Arc;
use thiserror::Error;

/// Cause attached to a rejected inbound message.
///
/// Shared because the same cause is handed to observers, the dead-letter
/// sink and the failure observer.
pub type ProcessingFailure = Arc<dyn std::error::Error + Send + Sync>;

/// The main error type for kafka-channels operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid channel configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Settings(#[from] config::ConfigError),

    /// No value serializer was configured for an outgoing channel.
    #[error("Missing value serializer for channel '{channel}', set `value_serializer` on the outgoing channel")]
    MissingValueSerializer {
        /// Channel name
        channel: String,
    },

    /// A serializer name that does not map to a known serializer.
    #[error("Unknown serializer '{name}' configured for channel '{channel}'")]
    UnknownSerializer {
        /// Channel name
        channel: String,
        /// Configured serializer name
        name: String,
    },

    /// No serialization failure handler is registered under the identifier.
    #[error("Unable to find serialization failure handler '{name}' for channel '{channel}'")]
    HandlerNotFound {
        /// Channel name
        channel: String,
        /// Handler identifier
        name: String,
    },

    /// More than one serialization failure handler matches the identifier.
    #[error("Ambiguous serialization failure handler '{name}' for channel '{channel}': {count} handlers match")]
    HandlerAmbiguous {
        /// Channel name
        channel: String,
        /// Handler identifier
        name: String,
        /// Number of matching handlers
        count: usize,
    },

    /// Kafka client or broker error, as reported by the client.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// A key or value could not be serialized and no handler recovered it.
    #[error("Unable to serialize {target} for topic '{topic}': {message}")]
    Encode {
        /// Destination topic
        topic: String,
        /// `"key"` or `"value"`
        target: &'static str,
        /// Serializer failure description
        message: String,
    },

    /// The broker acknowledged a record on a different topic than requested.
    #[error("Record sent to topic '{expected}' was acknowledged on topic '{actual}'")]
    TopicMismatch {
        /// Topic of the submitted record
        expected: String,
        /// Topic reported by the broker
        actual: String,
    },

    /// The producer could not be constructed. Shared by every caller until reset.
    #[error("Unable to initialize producer for channel '{channel}': {source}")]
    ProducerInit {
        /// Channel name
        channel: String,
        /// Memoized construction failure
        source: Arc<Error>,
    },

    /// The producer (or its sending thread) has been closed.
    #[error("Producer for channel '{channel}' is closed")]
    Closed {
        /// Channel name
        channel: String,
    },

    /// Application processing of an inbound message failed.
    #[error("Processing failed: {0}")]
    Processing(ProcessingFailure),

    /// The channel stopped after a nack under the fail-stop strategy.
    #[error("Channel '{channel}' halted after a processing failure")]
    Halted {
        /// Channel name
        channel: String,
    },

    /// Forwarding a failed message to the dead-letter topic failed.
    #[error("Unable to forward message from channel '{channel}' to the dead-letter topic: {source}")]
    DeadLetter {
        /// Channel name
        channel: String,
        /// Forwarding failure
        source: Box<Error>,
    },

    /// I/O error, typically when spawning the sending thread.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps an application failure as a [`ProcessingFailure`].
    pub fn processing(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let cause: Box<dyn std::error::Error + Send + Sync> = cause.into();
        Error::Processing(Arc::from(cause))
    }

    /// Returns the raw Kafka error if this error came from the broker client.
    pub fn kafka_error(&self) -> Option<&rdkafka::error::KafkaError> {
        match self {
            Error::Kafka(e) => Some(e),
            Error::ProducerInit { source, .. } => source.kafka_error(),
            _ => None,
        }
    }
}

/// A convenient Result type alias for kafka-channels operations.
///
/// This is equivalent to `std::result::Result<T, kafka_channels::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
