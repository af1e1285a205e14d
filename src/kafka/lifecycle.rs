//! Producer lifecycle of an outgoing channel.
//!
//! A [`ProducerManager`] owns at most one broker producer, created on first
//! use (or at startup for eager channels). Every operation that touches the
//! producer, construction and close included, runs as a job on the channel's
//! [`SendingThread`], so operations execute one at a time in the order they
//! were submitted.

use crate::config::{self, ProducerOptions};
use crate::kafka::failure_handler::HandlerRegistry;
use crate::kafka::producer::{BrokerProducer, ProducerFactory, SerializedRecord};
use crate::kafka::sending_thread::SendingThread;
use crate::kafka::serializer::SerializerWrapper;
use crate::kafka::OutgoingRecord;
use crate::observe::Observers;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a call to [`ProducerManager::close`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The producer was closed and the sending thread released.
    Closed,
    /// No confirmation within twice the close timeout. Shutdown proceeds in
    /// the background.
    TimedOut,
    /// The caller must not block; close was scheduled without waiting.
    Detached,
    /// An earlier call already closed the channel.
    AlreadyClosed,
}

/// Refers to a channel's producer without keeping it alive. The producer
/// itself is only reachable through jobs on the sending thread.
pub struct ProducerHandle<P> {
    producer: Weak<P>,
}

impl<P> ProducerHandle<P> {
    /// False once the producer has been closed and released.
    pub fn is_open(&self) -> bool {
        self.producer.strong_count() > 0
    }

    /// Whether both handles refer to the same producer instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.producer, &other.producer)
    }
}

impl<P> Clone for ProducerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            producer: Weak::clone(&self.producer),
        }
    }
}

impl<P> fmt::Debug for ProducerHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

enum HandleState<P> {
    Uninitialized,
    Ready(Arc<P>),
    Failed(Arc<Error>),
    Closed,
}

/// State reachable from jobs running on the sending thread.
pub(crate) struct Inner<F: ProducerFactory> {
    channel: String,
    client_properties: BTreeMap<String, String>,
    transactional: bool,
    pub(crate) operation_timeout: Duration,
    factory: F,
    key_serializer: SerializerWrapper,
    value_serializer: SerializerWrapper,
    state: Mutex<HandleState<F::Producer>>,
    observers: Observers,
}

impl<F: ProducerFactory> Inner<F> {
    /// Returns the producer, constructing it on first call.
    ///
    /// A construction failure is kept and returned to every later caller
    /// until [`ProducerManager::reset`].
    pub(crate) fn handle(&self) -> Result<Arc<F::Producer>> {
        let mut state = self.state.lock();
        let constructed = match &*state {
            HandleState::Ready(producer) => return Ok(Arc::clone(producer)),
            HandleState::Failed(cause) => return Err(self.init_error(cause)),
            HandleState::Closed => {
                return Err(Error::Closed {
                    channel: self.channel.clone(),
                })
            }
            HandleState::Uninitialized => self.construct(),
        };

        let outcome = match constructed {
            Ok(producer) => {
                let producer = Arc::new(producer);
                *state = HandleState::Ready(Arc::clone(&producer));
                Ok(producer)
            }
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Unable to initialize producer");
                let cause = Arc::new(e);
                let err = self.init_error(&cause);
                *state = HandleState::Failed(cause);
                Err(err)
            }
        };
        // Observers may call back into the manager, e.g. `reset`.
        drop(state);

        match &outcome {
            Ok(_) => self.observers.report_created(&self.channel, &self.client_properties),
            Err(err) => self.observers.report_failure(err),
        }
        outcome
    }

    fn construct(&self) -> Result<F::Producer> {
        let producer = self.factory.create(&self.channel, &self.client_properties)?;
        if self.transactional {
            if let Err(e) = producer.init_transactions(self.operation_timeout) {
                producer.close(Duration::ZERO);
                return Err(e);
            }
            debug!(channel = %self.channel, "Transactions initialized");
        }
        info!(
            channel = %self.channel,
            client_id = self
                .client_properties
                .get(config::CLIENT_ID)
                .map(String::as_str)
                .unwrap_or(""),
            "Producer ready"
        );
        Ok(producer)
    }

    fn init_error(&self, cause: &Arc<Error>) -> Error {
        Error::ProducerInit {
            channel: self.channel.clone(),
            source: Arc::clone(cause),
        }
    }

    pub(crate) fn serialize(&self, record: OutgoingRecord) -> Result<SerializedRecord> {
        let key = self
            .key_serializer
            .serialize(&record.topic, record.key.as_ref(), &record.headers)?;
        let value = self
            .value_serializer
            .serialize(&record.topic, record.payload.as_ref(), &record.headers)?;
        Ok(SerializedRecord {
            topic: record.topic,
            partition: record.partition,
            key,
            value,
            headers: record.headers,
            timestamp: record.timestamp,
        })
    }

    fn close(&self, timeout: Duration) {
        let previous = std::mem::replace(&mut *self.state.lock(), HandleState::Closed);
        if let HandleState::Ready(producer) = previous {
            producer.close(timeout);
            info!(channel = %self.channel, "Producer closed");
        }
    }
}

pub struct ProducerManager<F: ProducerFactory> {
    inner: Arc<Inner<F>>,
    thread: Arc<SendingThread>,
    closed: AtomicBool,
    close_timeout: Duration,
    client_id: String,
    configuration: BTreeMap<String, String>,
    pub(crate) observers: Observers,
}

impl<F: ProducerFactory> ProducerManager<F> {
    /// Validates the channel configuration and starts its sending thread.
    ///
    /// Serializer and failure handler bindings are resolved here, so a
    /// misconfigured channel fails immediately. Unless the channel is lazy,
    /// the producer is also constructed before returning.
    pub fn new(
        options: ProducerOptions,
        factory: F,
        handlers: &HandlerRegistry,
        observers: Observers,
    ) -> Result<Self> {
        let channel = options.channel.clone();

        let value_serializer_name =
            options
                .properties
                .get(config::VALUE_SERIALIZER)
                .ok_or_else(|| Error::MissingValueSerializer {
                    channel: channel.clone(),
                })?;
        let key_serializer_name = options
            .properties
            .get(config::KEY_SERIALIZER)
            .map(String::as_str)
            .unwrap_or("string");

        let key_handler =
            handlers.resolve(&channel, options.key_serialization_failure_handler.as_deref())?;
        let value_handler =
            handlers.resolve(&channel, options.value_serialization_failure_handler.as_deref())?;

        let key_serializer =
            SerializerWrapper::new(&channel, key_serializer_name, true, key_handler)?;
        let value_serializer =
            SerializerWrapper::new(&channel, value_serializer_name, false, value_handler)?;

        let thread = Arc::new(SendingThread::spawn(&channel)?);

        let inner = Arc::new(Inner {
            channel: channel.clone(),
            client_properties: config::client_properties(&options.properties),
            transactional: options.is_transactional(),
            operation_timeout: options.operation_timeout,
            factory,
            key_serializer,
            value_serializer,
            state: Mutex::new(HandleState::Uninitialized),
            observers: observers.clone(),
        });

        let manager = Self {
            inner,
            thread,
            closed: AtomicBool::new(false),
            close_timeout: options.close_timeout,
            client_id: options.client_id().to_string(),
            configuration: options.properties,
            observers,
        };

        if !options.lazy_client {
            debug!(channel = %channel, "Eager channel, creating producer at startup");
            futures::executor::block_on(manager.get_handle())?;
        }

        Ok(manager)
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The channel properties, connector keys included.
    pub fn configuration(&self) -> &BTreeMap<String, String> {
        &self.configuration
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues `work` on the sending thread. The job is queued when this
    /// method is called, not when the returned future is first polled.
    pub(crate) fn submit<T, W>(&self, work: W) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        W: FnOnce(&Inner<F>) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let channel = self.inner.channel.clone();
        let queued = self.thread.execute(move || work(&inner));

        async move {
            match queued?.await {
                Ok(result) => result,
                Err(_) => Err(Error::Closed { channel }),
            }
        }
    }

    /// Resolves once the producer is ready, constructing it if needed.
    pub fn get_handle(
        &self,
    ) -> impl Future<Output = Result<ProducerHandle<F::Producer>>> + Send + 'static {
        self.submit(|inner| {
            let producer = inner.handle()?;
            Ok(ProducerHandle {
                producer: Arc::downgrade(&producer),
            })
        })
    }

    /// Runs `work` against the producer on the sending thread, after every
    /// previously submitted operation of this channel.
    pub fn run_on_sending_thread<T, W>(
        &self,
        work: W,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        W: FnOnce(&F::Producer) -> Result<T> + Send + 'static,
    {
        self.submit(move |inner| {
            let producer = inner.handle()?;
            work(&producer)
        })
    }

    /// Forgets a failed construction so the next operation tries again.
    /// Returns whether a failure was cleared.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(*state, HandleState::Failed(_)) {
            info!(channel = %self.inner.channel, "Resetting failed producer");
            *state = HandleState::Uninitialized;
            true
        } else {
            false
        }
    }

    /// Closes the producer with the configured close timeout.
    pub fn close(&self) -> CloseOutcome {
        self.close_with_timeout(self.close_timeout)
    }

    /// Closes the producer exactly once.
    ///
    /// Callers inside an async runtime, or on the sending thread itself, do
    /// not wait. Other callers wait up to twice `timeout` for the close to
    /// complete and then return regardless.
    pub fn close_with_timeout(&self, timeout: Duration) -> CloseOutcome {
        if !self.mark_closed() {
            return CloseOutcome::AlreadyClosed;
        }

        let (done_tx, done_rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let queued = self.thread.execute(move || {
            inner.close(timeout);
            let _ = done_tx.send(());
        });
        self.thread.shutdown();

        if queued.is_err() {
            return CloseOutcome::Closed;
        }
        if self.thread.is_current() || tokio::runtime::Handle::try_current().is_ok() {
            debug!(channel = %self.inner.channel, "Closing producer in the background");
            return CloseOutcome::Detached;
        }

        match done_rx.recv_timeout(timeout * 2) {
            Ok(()) => {
                self.thread.join();
                CloseOutcome::Closed
            }
            Err(_) => {
                warn!(
                    channel = %self.inner.channel,
                    timeout_ms = (timeout * 2).as_millis() as u64,
                    "Producer close timed out"
                );
                CloseOutcome::TimedOut
            }
        }
    }

    /// Awaitable close, bounded by twice the configured close timeout.
    pub async fn close_async(&self) -> CloseOutcome {
        if !self.mark_closed() {
            return CloseOutcome::AlreadyClosed;
        }

        let timeout = self.close_timeout;
        let inner = Arc::clone(&self.inner);
        let queued = self.thread.execute(move || inner.close(timeout));
        self.thread.shutdown();

        let Ok(done) = queued else {
            return CloseOutcome::Closed;
        };
        match tokio::time::timeout(timeout * 2, done).await {
            Ok(_) => CloseOutcome::Closed,
            Err(_) => {
                warn!(
                    channel = %self.inner.channel,
                    timeout_ms = (timeout * 2).as_millis() as u64,
                    "Producer close timed out"
                );
                CloseOutcome::TimedOut
            }
        }
    }

    fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<F: ProducerFactory> Drop for ProducerManager<F> {
    fn drop(&mut self) {
        if self.mark_closed() {
            let inner = Arc::clone(&self.inner);
            let timeout = self.close_timeout;
            let _ = self.thread.execute(move || inner.close(timeout));
            self.thread.shutdown();
        }
    }
}
