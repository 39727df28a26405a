//! Channel events: what the core tells the outside world about a task.
//!
//! Per task the core produces a stream of `status` / `partial` / `complete`
//! events. Concrete front-ends (CLI, chat adapters) subscribe through the
//! [`ChannelBus`] and implement [`ExternalChannel`] for actual delivery.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Planning,
    Executing,
    Critiquing,
    Synthesizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    Status {
        task_id: String,
        phase: TaskPhase,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Partial {
        task_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Complete {
        task_id: String,
        /// Final status as a string ("completed" / "failed" / "cancelled").
        status: String,
        result: String,
        #[serde(default)]
        files: Vec<PathBuf>,
        timestamp: DateTime<Utc>,
    },
}

impl ChannelEvent {
    pub fn status(task_id: impl Into<String>, phase: TaskPhase, agent: Option<String>) -> Self {
        ChannelEvent::Status {
            task_id: task_id.into(),
            phase,
            agent,
            tool: None,
            timestamp: Utc::now(),
        }
    }

    pub fn complete(
        task_id: impl Into<String>,
        status: impl Into<String>,
        result: impl Into<String>,
        files: Vec<PathBuf>,
    ) -> Self {
        ChannelEvent::Complete {
            task_id: task_id.into(),
            status: status.into(),
            result: result.into(),
            files,
            timestamp: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            ChannelEvent::Status { task_id, .. }
            | ChannelEvent::Partial { task_id, .. }
            | ChannelEvent::Complete { task_id, .. } => task_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery sinks
// ---------------------------------------------------------------------------

/// Thin contract an actual channel adapter implements.
pub trait ExternalChannel: Send + Sync {
    fn deliver_text(&self, text: &str);
    fn send_file(&self, path: &std::path::Path, caption: &str);
}

// ---------------------------------------------------------------------------
// ChannelBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on flume channels.
///
/// Each `subscribe` creates a receiver that gets every event published from
/// then on; disconnected subscribers are pruned on publish.
#[derive(Clone)]
pub struct ChannelBus {
    inner: Arc<Mutex<Vec<flume::Sender<ChannelEvent>>>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<ChannelEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().expect("channel bus lock poisoned").push(tx);
        rx
    }

    pub fn publish(&self, event: ChannelEvent) {
        let mut senders = self.inner.lock().expect("channel bus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("channel bus lock poisoned").len()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
