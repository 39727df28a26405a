//! Worker heartbeat files.
//!
//! Each agent process is the single writer of `heartbeats/<agent_id>.json`;
//! the supervisor and status surfaces read them without locks. The file is
//! removed on clean exit so a lingering heartbeat means a live (or crashed)
//! worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use relay_core::paths::WorkDir;
use relay_core::types::unix_seconds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub agent_id: String,
    /// "working" | "idle"
    pub status: String,
    #[serde(default)]
    pub progress: Option<String>,
    pub pid: u32,
    #[serde(with = "unix_seconds")]
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Heartbeat {
    path: PathBuf,
    agent_id: String,
}

impl Heartbeat {
    pub fn new(workdir: &WorkDir, agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            path: workdir.heartbeat_file(&agent_id),
            agent_id,
        }
    }

    /// Write the current beat. Single writer, so a plain overwrite suffices.
    pub fn beat(&self, status: &str, progress: Option<&str>) {
        let record = HeartbeatRecord {
            agent_id: self.agent_id.clone(),
            status: status.to_string(),
            progress: progress.map(str::to_string),
            pid: std::process::id(),
            ts: Utc::now(),
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::debug!(agent_id = %self.agent_id, error = %e, "heartbeat write failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "heartbeat serialize failed"),
        }
    }

    /// Remove the heartbeat file on clean exit.
    pub fn stop(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// An agent whose last beat is older than the staleness threshold.
#[derive(Debug, Clone)]
pub struct StaleHeartbeat {
    pub agent_id: String,
    pub last_seen: DateTime<Utc>,
    pub stale_for: Duration,
}

pub struct HeartbeatMonitor {
    dir: PathBuf,
    staleness_threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn new(workdir: &WorkDir, staleness_threshold: Duration) -> Self {
        Self {
            dir: workdir.heartbeats_dir(),
            staleness_threshold,
        }
    }

    /// Read every heartbeat file in the directory.
    pub fn read_all(&self) -> Vec<HeartbeatRecord> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let text = std::fs::read_to_string(entry.path()).ok()?;
                serde_json::from_str(&text).ok()
            })
            .collect()
    }

    /// Agents whose heartbeat has gone stale.
    pub fn stale_agents(&self) -> Vec<StaleHeartbeat> {
        let now = Utc::now();
        self.read_all()
            .into_iter()
            .filter_map(|record| {
                let elapsed = (now - record.ts).to_std().unwrap_or(Duration::ZERO);
                if elapsed > self.staleness_threshold {
                    Some(StaleHeartbeat {
                        agent_id: record.agent_id,
                        last_seen: record.ts,
                        stale_for: elapsed,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
