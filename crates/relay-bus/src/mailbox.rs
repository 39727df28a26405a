//! Per-agent append-only inboxes.
//!
//! Senders append one JSONL record under the recipient's lock; the recipient
//! drains its inbox with move-then-delete for crash safety: the inbox file is
//! renamed to a `.processing` sibling, parsed, then deleted. If the process
//! crashes after the rename but before the delete, the `.processing` file
//! survives and is recovered on the next drain - delivery is at-least-once
//! and consumers must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use relay_core::lockfile::FileLock;
use relay_core::paths::WorkDir;
use relay_core::types::{unix_seconds, CritiqueSpec};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("io error on mailbox {recipient}: {source}")]
    Io {
        recipient: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed message payload: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, MailboxError>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Highest priority: the worker loop exits cleanly on receipt.
    Shutdown,
    CritiqueRequest,
    CritiqueReply,
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub from: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(with = "unix_seconds")]
    pub ts: DateTime<Utc>,
}

impl MailMessage {
    pub fn new(from: impl Into<String>, kind: MessageKind, content: serde_json::Value) -> Self {
        Self {
            from: from.into(),
            kind,
            content,
            ts: Utc::now(),
        }
    }
}

/// Payload of a `critique_request` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub task_id: String,
    pub description: String,
    pub result: String,
}

impl CritiqueRequest {
    pub fn from_content(content: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(content.clone()).map_err(|e| MailboxError::Payload(e.to_string()))
    }

    pub fn into_content(self) -> serde_json::Value {
        serde_json::to_value(self).expect("critique request is always serializable")
    }
}

/// Payload of a `critique_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReply {
    pub task_id: String,
    pub critique: CritiqueSpec,
}

impl CritiqueReply {
    pub fn from_content(content: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(content.clone()).map_err(|e| MailboxError::Payload(e.to_string()))
    }

    pub fn into_content(self) -> serde_json::Value {
        serde_json::to_value(self).expect("critique reply is always serializable")
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Mailbox {
    workdir: WorkDir,
}

impl Mailbox {
    pub fn new(workdir: WorkDir) -> Self {
        Self { workdir }
    }

    /// Append one message to `to`'s inbox under its lock.
    pub fn send(&self, to: &str, message: MailMessage) -> Result<()> {
        let path = self.workdir.mailbox_file(to);
        let lock = FileLock::new(self.workdir.mailbox_lock(to));

        let line = serde_json::to_string(&message)
            .map_err(|e| MailboxError::Payload(e.to_string()))?;

        let _guard = lock.acquire().map_err(|e| self.io_err(to, e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(to, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| self.io_err(to, e))?;
        writeln!(file, "{line}").map_err(|e| self.io_err(to, e))?;

        tracing::debug!(from = %message.from, to = %to, kind = ?message.kind, "mail sent");
        Ok(())
    }

    /// Drain `recipient`'s inbox. Reading removes delivered items from disk.
    pub fn drain(&self, recipient: &str) -> Result<Vec<MailMessage>> {
        let path = self.workdir.mailbox_file(recipient);
        let processing = path.with_extension("jsonl.processing");
        let lock = FileLock::new(self.workdir.mailbox_lock(recipient));

        let _guard = lock.acquire().map_err(|e| self.io_err(recipient, e))?;
        let mut messages = Vec::new();

        // Recover a previously interrupted drain first.
        if processing.exists() {
            tracing::warn!(
                recipient = %recipient,
                "recovering unprocessed mailbox from previous crash"
            );
            messages.extend(parse_jsonl(&processing, recipient));
            let _ = std::fs::remove_file(&processing);
        }

        if path.exists() {
            match std::fs::rename(&path, &processing) {
                Ok(()) => {
                    messages.extend(parse_jsonl(&processing, recipient));
                    let _ = std::fs::remove_file(&processing);
                }
                Err(e) => {
                    // Fall back to read-in-place + truncate.
                    tracing::error!(recipient = %recipient, error = %e, "mailbox rename failed");
                    messages.extend(parse_jsonl(&path, recipient));
                    std::fs::write(&path, b"").map_err(|e| self.io_err(recipient, e))?;
                }
            }
        }

        Ok(messages)
    }

    fn io_err(&self, recipient: &str, source: std::io::Error) -> MailboxError {
        MailboxError::Io {
            recipient: recipient.to_string(),
            source,
        }
    }
}

/// Parse a JSONL mailbox file, skipping corrupt lines.
fn parse_jsonl(path: &Path, recipient: &str) -> Vec<MailMessage> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(msg) => Some(msg),
            Err(_) => {
                let excerpt: String = line.chars().take(80).collect();
                tracing::warn!(
                    recipient = %recipient,
                    line = %excerpt,
                    "skipping corrupt mailbox line"
                );
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
