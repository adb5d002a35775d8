use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One human-readable status line.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub at: DateTime<Local>,
    pub message: String,
}

impl ProgressEvent {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            message: message.into(),
        }
    }
}

/// Append-only destination for progress events.
pub trait ProgressSink: Send + Sync {
    fn append(&self, event: ProgressEvent);
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }
}

impl ProgressSink for MemoryLog {
    fn append(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Forwards events to a consumer task (console printer, GUI bridge).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn append(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("Progress receiver dropped, event discarded");
        }
    }
}

/// Writes events to the log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn append(&self, event: ProgressEvent) {
        info!("{}", event.message);
    }
}

/// Cheap, cloneable handle the rest of the crate reports through.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ProgressSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    pub fn report(&self, message: impl Into<String>) {
        let event = ProgressEvent::now(message);
        debug!(target: "progress", "{}", event.message);
        self.sink.append(event);
    }
}
