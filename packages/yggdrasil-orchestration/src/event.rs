//! Events flowing from the watchers to the dispatcher
//!
//! Events are transient: they live only on the in-memory channel and are
//! never persisted. Delivery goes through [`EventSink::emit`], which either
//! hands the whole event to the channel or drops it on shutdown.

use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the watcher → dispatcher channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A project document is new or changed
    ProjectChanged { doc_id: String },
    /// A trigger file appeared under a watched directory
    FileTrigger {
        /// Trigger key, `<watcher name>/<relative path>`
        key: String,
        path: PathBuf,
    },
    ExternalSignal(Signal),
}

/// Out-of-band instructions to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Re-dispatch every project left in flight (startup recovery)
    Rescan,
    /// Stop consuming events and drain
    Shutdown,
}

impl Event {
    pub fn project(doc_id: impl Into<String>) -> Self {
        Event::ProjectChanged {
            doc_id: doc_id.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProjectChanged { .. } => "project_changed",
            Event::FileTrigger { .. } => "file_trigger",
            Event::ExternalSignal(_) => "external_signal",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ProjectChanged { doc_id } => write!(f, "ProjectChanged({})", doc_id),
            Event::FileTrigger { key, .. } => write!(f, "FileTrigger({})", key),
            Event::ExternalSignal(signal) => write!(f, "ExternalSignal({:?})", signal),
        }
    }
}

/// Sending half of the event stream, bound to the shutdown token
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>, shutdown: CancellationToken) -> Self {
        Self { tx, shutdown }
    }

    /// Deliver `event`; returns false if it was not delivered
    ///
    /// A full channel applies backpressure; shutdown or a closed receiver
    /// abandons the send without delivering anything.
    pub async fn emit(&self, event: Event) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Create a bounded event channel and its sink
pub fn channel(shutdown: CancellationToken) -> (EventSink, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSink::new(tx, shutdown), rx)
}
