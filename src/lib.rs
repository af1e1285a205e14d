pub mod ack;
pub mod config;
pub mod error;
pub mod observe;
pub mod types;

pub mod kafka;
pub mod test_utils;

pub use ack::{AckEngine, CommitStrategy, FailureStrategy, IncomingChannel, IncomingMessage};
pub use crate::config::{Config, ProducerOptions};
pub use error::{Error, Result};
pub use kafka::{CloseOutcome, OutgoingRecord, ProducerManager};
