pub mod delivery;
pub mod failure_handler;
pub mod lifecycle;
pub mod producer;
pub mod sending_thread;
pub mod serializer;

pub use delivery::OutgoingRecord;
pub use failure_handler::{
    from_fn, HandlerRegistry, SerializationFailure, SerializationFailureHandler,
};
pub use lifecycle::{CloseOutcome, ProducerHandle, ProducerManager};
pub use producer::{
    BrokerProducer, KafkaBrokerProducer, KafkaProducerFactory, PartitionInfo, ProducerFactory,
    RecordMetadata, SerializedRecord,
};
pub use sending_thread::SendingThread;
pub use serializer::{Payload, SerializerKind};
