//! Named serialization failure handlers.
//!
//! A handler is bound to an outgoing channel by identifier
//! (`key_serialization_failure_handler` / `value_serialization_failure_handler`).
//! The identifier is resolved once, when the producer is built, and a missing
//! or ambiguous binding fails the construction.

use crate::kafka::serializer::{Payload, SerializationError};
use crate::types::RecordHeader;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler: recovered bytes (`None` writes a null key/value),
/// or the failure to propagate to the sender.
pub type HandlerResult = std::result::Result<Option<Vec<u8>>, BoxError>;

/// Context handed to a handler when a key or value fails to serialize.
#[derive(Debug)]
pub struct SerializationFailure<'a> {
    pub topic: &'a str,
    pub is_key: bool,
    pub serializer: &'a str,
    pub payload: &'a Payload,
    pub headers: &'a [RecordHeader],
    pub error: &'a SerializationError,
}

pub trait SerializationFailureHandler: Send + Sync {
    fn handle(&self, failure: &SerializationFailure<'_>) -> HandlerResult;
}

/// Adapts a closure into a [`SerializationFailureHandler`].
pub struct FnHandler<F>(F);

pub fn from_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&SerializationFailure<'_>) -> HandlerResult + Send + Sync,
{
    FnHandler(f)
}

impl<F> SerializationFailureHandler for FnHandler<F>
where
    F: Fn(&SerializationFailure<'_>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, failure: &SerializationFailure<'_>) -> HandlerResult {
        (self.0)(failure)
    }
}

/// Lookup table of handlers keyed by identifier.
///
/// Several handlers may be registered under the same identifier; resolving
/// such an identifier is an error.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<(String, Arc<dyn SerializationFailureHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, identifier: impl Into<String>, handler: H) -> &mut Self
    where
        H: SerializationFailureHandler + 'static,
    {
        self.handlers.push((identifier.into(), Arc::new(handler)));
        self
    }

    pub fn lookup(
        &self,
        channel: &str,
        identifier: &str,
    ) -> Result<Arc<dyn SerializationFailureHandler>> {
        let mut matching = self
            .handlers
            .iter()
            .filter(|(name, _)| name == identifier)
            .map(|(_, handler)| handler);

        match (matching.next(), matching.count()) {
            (None, _) => Err(Error::HandlerNotFound {
                channel: channel.to_string(),
                name: identifier.to_string(),
            }),
            (Some(handler), 0) => Ok(Arc::clone(handler)),
            (Some(_), rest) => Err(Error::HandlerAmbiguous {
                channel: channel.to_string(),
                name: identifier.to_string(),
                count: rest + 1,
            }),
        }
    }

    /// Resolves an optional binding. No identifier means no handler.
    pub fn resolve(
        &self,
        channel: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Arc<dyn SerializationFailureHandler>>> {
        identifier
            .map(|identifier| self.lookup(channel, identifier))
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(name, _)| name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recover(bytes: &'static [u8]) -> impl SerializationFailureHandler {
        from_fn(move |_| Ok(Some(bytes.to_vec())))
    }

    #[test]
    fn test_lookup_single_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("fallback", recover(b"x"));

        let handler = registry.lookup("orders", "fallback").unwrap();
        let error = SerializationError::new("int", "not an integer");
        let payload = Payload::from("abc");
        let failure = SerializationFailure {
            topic: "orders",
            is_key: false,
            serializer: "int",
            payload: &payload,
            headers: &[],
            error: &error,
        };
        assert_eq!(handler.handle(&failure).unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_lookup_not_found() {
        let registry = HandlerRegistry::new();
        match registry.lookup("orders", "missing") {
            Err(Error::HandlerNotFound { channel, name }) => {
                assert_eq!(channel, "orders");
                assert_eq!(name, "missing");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_lookup_ambiguous() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("fallback", recover(b"a"))
            .register("fallback", recover(b"b"))
            .register("other", recover(b"c"));

        match registry.lookup("orders", "fallback") {
            Err(Error::HandlerAmbiguous { count, .. }) => assert_eq!(count, 2),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(registry.lookup("orders", "other").is_ok());
    }

    #[test]
    fn test_resolve_without_identifier() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("orders", None).unwrap().is_none());
        assert!(registry.resolve("orders", Some("nope")).is_err());
    }
}
