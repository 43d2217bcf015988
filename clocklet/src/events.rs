//! Lifecycle and progress event relay.
//!
//! The core publishes `AgentEvent`s on a broadcast bus; the interface
//! layer subscribes and forwards each event to its own channel named by
//! [`AgentEvent::channel`]. A notifier task additionally fans the
//! user-facing subset out to an OS notification surface. The relay never
//! mutates state.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A sync pass is about to be dispatched.
    SyncStarted,
    /// A sync pass settled successfully; `result` is the worker's run
    /// record, relayed unchanged.
    SyncCompleted {
        records_synced: u64,
        result: Value,
    },
    /// A sync pass settled with an error.
    SyncFailed {
        message: String,
    },
    /// Handshake resolved; the worker accepts calls.
    WorkerReady,
    /// The worker is gone or failed to start.
    WorkerError {
        message: String,
        recoverable: bool,
    },
}

impl AgentEvent {
    /// Channel name the interface layer republishes this event on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::SyncStarted => "sync:started",
            Self::SyncCompleted { .. } => "sync:completed",
            Self::SyncFailed { .. } => "sync:error",
            Self::WorkerReady => "worker:ready",
            Self::WorkerError { .. } => "worker:error",
        }
    }

    /// Payload shipped alongside the channel name.
    pub fn payload(&self) -> Value {
        match self {
            Self::SyncStarted | Self::WorkerReady => Value::Null,
            Self::SyncCompleted {
                records_synced,
                result,
            } => json!({ "records_synced": records_synced, "result": result }),
            Self::SyncFailed { message } => json!({ "message": message }),
            Self::WorkerError {
                message,
                recoverable,
            } => json!({ "message": message, "recoverable": recoverable }),
        }
    }
}

/// Broadcast bus for agent events. Cheap to clone; publishing with no
/// subscribers is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: AgentEvent) {
        tracing::debug!(channel = event.channel(), "Publishing event");
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

/// OS notification surface. Implemented by the desktop shell; the default
/// [`TracingNotifier`] just logs.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, summary: &str, body: &str);
}

pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, summary: &str, body: &str) {
        tracing::info!(summary, body, "Notification");
    }
}

/// The subset of events worth an OS notification, with display text.
fn notification_text(event: &AgentEvent) -> Option<(String, String)> {
    match event {
        AgentEvent::SyncCompleted { records_synced, .. } => Some((
            "Sync completed".to_string(),
            format!("{records_synced} attendance records synced"),
        )),
        AgentEvent::SyncFailed { message } => {
            Some(("Sync failed".to_string(), message.clone()))
        }
        AgentEvent::WorkerError { message, .. } => {
            Some(("Background worker stopped".to_string(), message.clone()))
        }
        AgentEvent::SyncStarted | AgentEvent::WorkerReady => None,
    }
}

/// Forward user-facing events from the bus to an OS notification sink
/// until the bus is dropped.
pub fn spawn_notifier(bus: &EventBus, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some((summary, body)) = notification_text(&event) {
                        sink.notify(&summary, &body).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notifier fell behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
