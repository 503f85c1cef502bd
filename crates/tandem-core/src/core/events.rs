//! Session events and the per-project event bus.
//!
//! Within one project, events are delivered to each subscriber in emission
//! order. Streaming snapshots are best-effort: a slow subscriber may miss
//! intermediate snapshots but never observes them out of order, and every
//! snapshot is complete on its own. Lifecycle events are always delivered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::session::{Message, ToolCall};

/// Default capacity for subscriber channels.
///
/// Sized to absorb bursts of streaming snapshots without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Events published while sessions change, all scoped by project id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Full snapshot of the draft message currently being streamed.
    StreamingUpdate {
        project_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// A message was appended to the conversation.
    MessageAdded {
        project_id: String,
        message: Message,
    },
    /// A generation completed with a final assistant message.
    GenerationFinished {
        project_id: String,
        message: Message,
    },
    /// A generation failed with a transport or loop error.
    GenerationFailed { project_id: String, error: String },
    /// A generation was cancelled before completing.
    GenerationCancelled { project_id: String },
}

impl SessionEvent {
    pub fn project_id(&self) -> &str {
        match self {
            SessionEvent::StreamingUpdate { project_id, .. }
            | SessionEvent::MessageAdded { project_id, .. }
            | SessionEvent::GenerationFinished { project_id, .. }
            | SessionEvent::GenerationFailed { project_id, .. }
            | SessionEvent::GenerationCancelled { project_id } => project_id,
        }
    }
}

/// Receiver half of a per-project subscription.
pub type EventRx = mpsc::Receiver<Arc<SessionEvent>>;

type EventTx = mpsc::Sender<Arc<SessionEvent>>;

/// Ordered, per-project notification channels.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<EventTx>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new subscriber for one project's events.
    pub fn subscribe(&self, project_id: &str) -> EventRx {
        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        self.lock()
            .entry(project_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Best-effort send for high-volume streaming snapshots.
    ///
    /// Never awaits; a subscriber with a full channel misses this snapshot.
    /// Closed subscribers are swept out.
    pub(crate) fn send_streaming(&self, event: SessionEvent) {
        let event = Arc::new(event);
        let mut subscribers = self.lock();
        if let Some(txs) = subscribers.get_mut(event.project_id()) {
            txs.retain(|tx| match tx.try_send(Arc::clone(&event)) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Reliable send for lifecycle events; awaits delivery to every live
    /// subscriber.
    pub(crate) async fn send(&self, event: SessionEvent) {
        let event = Arc::new(event);
        let txs: Vec<EventTx> = {
            let mut subscribers = self.lock();
            match subscribers.get_mut(event.project_id()) {
                Some(txs) => {
                    txs.retain(|tx| !tx.is_closed());
                    txs.clone()
                }
                None => return,
            }
        };
        for tx in txs {
            let _ = tx.send(Arc::clone(&event)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<EventTx>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
