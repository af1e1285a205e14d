//! The affinity context of a channel: one OS thread executing producer
//! operations one at a time, in submission order.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct SendingThread {
    name: String,
    channel: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SendingThread {
    pub fn spawn(channel: &str) -> Result<Self> {
        let name = format!("kafka-sending-thread-{}", channel);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(thread = %thread_name, "Sending thread started");
            while let Some(job) = receiver.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(thread = %thread_name, "Producer operation panicked");
                }
            }
            debug!(thread = %thread_name, "Sending thread stopped");
        })?;

        Ok(Self {
            name,
            channel: channel.to_string(),
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on this sending thread.
    pub fn is_current(&self) -> bool {
        thread::current().name() == Some(self.name.as_str())
    }

    /// Queues `work` behind every previously submitted job.
    ///
    /// The receiver yields `Error::Closed` if the thread was shut down
    /// before the job ran.
    pub fn execute<T, F>(&self, work: F) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(work());
        });

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(job).is_ok() => Ok(rx),
            _ => Err(self.closed()),
        }
    }

    /// Stops accepting work. Jobs already queued still run.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!(thread = %self.name, "Sending thread shutting down");
        }
    }

    /// Waits for the thread to drain its queue and exit.
    pub fn join(&self) {
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(thread = %self.name, "Sending thread terminated abnormally");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub(crate) fn closed(&self) -> Error {
        Error::Closed {
            channel: self.channel.clone(),
        }
    }
}

impl Drop for SendingThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
