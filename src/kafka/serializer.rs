use crate::kafka::failure_handler::{SerializationFailure, SerializationFailureHandler};
use crate::types::RecordHeader;
use crate::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Key or value of an outgoing record, before serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Int(i64),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => "bytes",
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
            Payload::Int(_) => "integer",
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Int(value)
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Int(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{serializer} serializer: {message}")]
pub struct SerializationError {
    pub serializer: &'static str,
    pub message: String,
}

impl SerializationError {
    pub fn new(serializer: &'static str, message: impl Into<String>) -> Self {
        Self {
            serializer,
            message: message.into(),
        }
    }
}

/// Serializers selectable by name in the channel configuration.
///
/// The Kafka Java class names of the equivalent serializers are accepted
/// as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerKind {
    String,
    Bytes,
    Json,
    /// 4-byte big endian
    Int,
    /// 8-byte big endian
    Long,
}

impl SerializerKind {
    pub fn name(&self) -> &'static str {
        match self {
            SerializerKind::String => "string",
            SerializerKind::Bytes => "bytes",
            SerializerKind::Json => "json",
            SerializerKind::Int => "int",
            SerializerKind::Long => "long",
        }
    }

    pub fn serialize(&self, payload: &Payload) -> std::result::Result<Vec<u8>, SerializationError> {
        let mismatch = || {
            SerializationError::new(
                self.name(),
                format!("cannot serialize a {} payload", payload.kind()),
            )
        };

        match (self, payload) {
            (SerializerKind::String, Payload::Text(s)) => Ok(s.as_bytes().to_vec()),
            (SerializerKind::String, Payload::Json(serde_json::Value::String(s))) => {
                Ok(s.as_bytes().to_vec())
            }
            (SerializerKind::Bytes, Payload::Bytes(b)) => Ok(b.to_vec()),
            (SerializerKind::Bytes, Payload::Text(s)) => Ok(s.as_bytes().to_vec()),
            (SerializerKind::Json, Payload::Json(v)) => {
                serde_json::to_vec(v).map_err(|e| SerializationError::new("json", e.to_string()))
            }
            (SerializerKind::Json, Payload::Text(s)) => {
                serde_json::to_vec(s).map_err(|e| SerializationError::new("json", e.to_string()))
            }
            (SerializerKind::Json, Payload::Int(i)) => Ok(i.to_string().into_bytes()),
            (SerializerKind::Int, Payload::Int(i)) => i32::try_from(*i)
                .map(|v| v.to_be_bytes().to_vec())
                .map_err(|_| {
                    SerializationError::new("int", format!("{} does not fit in 32 bits", i))
                }),
            (SerializerKind::Long, Payload::Int(i)) => Ok(i.to_be_bytes().to_vec()),
            _ => Err(mismatch()),
        }
    }
}

impl FromStr for SerializerKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "string" | "org.apache.kafka.common.serialization.StringSerializer" => {
                Ok(SerializerKind::String)
            }
            "bytes"
            | "byte-array"
            | "org.apache.kafka.common.serialization.ByteArraySerializer"
            | "org.apache.kafka.common.serialization.BytesSerializer" => Ok(SerializerKind::Bytes),
            "json" | "io.vertx.kafka.client.serialization.JsonObjectSerializer" => {
                Ok(SerializerKind::Json)
            }
            "int" | "integer" | "org.apache.kafka.common.serialization.IntegerSerializer" => {
                Ok(SerializerKind::Int)
            }
            "long" | "org.apache.kafka.common.serialization.LongSerializer" => {
                Ok(SerializerKind::Long)
            }
            _ => Err(()),
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A key or value serializer with its optional failure handler.
#[derive(Clone)]
pub struct SerializerWrapper {
    kind: SerializerKind,
    is_key: bool,
    handler: Option<Arc<dyn SerializationFailureHandler>>,
}

impl SerializerWrapper {
    /// Resolves `name` into a serializer for `channel`.
    pub fn new(
        channel: &str,
        name: &str,
        is_key: bool,
        handler: Option<Arc<dyn SerializationFailureHandler>>,
    ) -> Result<Self> {
        let kind = name.parse::<SerializerKind>().map_err(|_| Error::UnknownSerializer {
            channel: channel.to_string(),
            name: name.to_string(),
        })?;
        Ok(Self {
            kind,
            is_key,
            handler,
        })
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    pub fn serialize(
        &self,
        topic: &str,
        payload: Option<&Payload>,
        headers: &[RecordHeader],
    ) -> Result<Option<Vec<u8>>> {
        let Some(payload) = payload else {
            return Ok(None);
        };

        let target = if self.is_key { "key" } else { "value" };
        match self.kind.serialize(payload) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) => match &self.handler {
                Some(handler) => {
                    debug!(
                        topic = %topic,
                        target,
                        "Serialization failed, invoking failure handler"
                    );
                    let failure = SerializationFailure {
                        topic,
                        is_key: self.is_key,
                        serializer: self.kind.name(),
                        payload,
                        headers,
                        error: &error,
                    };
                    handler.handle(&failure).map_err(|cause| Error::Encode {
                        topic: topic.to_string(),
                        target,
                        message: cause.to_string(),
                    })
                }
                None => Err(Error::Encode {
                    topic: topic.to_string(),
                    target,
                    message: error.to_string(),
                }),
            },
        }
    }
}

impl fmt::Debug for SerializerWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerWrapper")
            .field("kind", &self.kind)
            .field("is_key", &self.is_key)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}
