//! Append-only JSONL audit log for tool invocations.
//!
//! One line per invocation in `logs/tool_audit.log`. Best-effort: an audit
//! write failure is logged and swallowed, it never fails the tool call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAuditRecord {
    pub agent_id: String,
    pub task_id: String,
    pub tool: String,
    pub params: serde_json::Value,
    pub ok: bool,
    #[serde(default)]
    pub detail: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &ToolAuditRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::debug!(error = %e, "tool audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("logs").join("tool_audit.log"));

        for i in 0..3 {
            log.append(&ToolAuditRecord {
                agent_id: "executor".into(),
                task_id: format!("t{i}"),
                tool: "shell".into(),
                params: json!({"cmd": "ls"}),
                ok: true,
                detail: None,
                ts: Utc::now(),
            });
        }

        let text = std::fs::read_to_string(dir.path().join("logs").join("tool_audit.log")).unwrap();
        assert_eq!(text.lines().count(), 3);
        let first: ToolAuditRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.task_id, "t0");
    }
}
