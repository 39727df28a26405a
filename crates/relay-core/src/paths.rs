//! Working-directory layout.
//!
//! All shared state lives under one working directory:
//!
//! ```text
//! task_board.json        .task_board.lock
//! context_bus.json       .context_bus.lock
//! subtasks.json          .subtasks.lock
//! mailboxes/<agent>.jsonl   .mailboxes/<agent>.jsonl.lock
//! task_signals/          (scratch wakeup signals)
//! heartbeats/<agent>.json
//! logs/<agent>.log       logs/tool_audit.log
//! .relayd.lock           (supervisor singleton guard)
//! ```

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn board_file(&self) -> PathBuf {
        self.root.join("task_board.json")
    }

    pub fn board_lock(&self) -> PathBuf {
        self.root.join(".task_board.lock")
    }

    pub fn context_bus_file(&self) -> PathBuf {
        self.root.join("context_bus.json")
    }

    pub fn context_bus_lock(&self) -> PathBuf {
        self.root.join(".context_bus.lock")
    }

    pub fn subtasks_file(&self) -> PathBuf {
        self.root.join("subtasks.json")
    }

    pub fn subtasks_lock(&self) -> PathBuf {
        self.root.join(".subtasks.lock")
    }

    pub fn mailbox_file(&self, agent_id: &str) -> PathBuf {
        self.root.join("mailboxes").join(format!("{agent_id}.jsonl"))
    }

    pub fn mailbox_lock(&self, agent_id: &str) -> PathBuf {
        self.root
            .join(".mailboxes")
            .join(format!("{agent_id}.jsonl.lock"))
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("task_signals")
    }

    pub fn heartbeats_dir(&self) -> PathBuf {
        self.root.join("heartbeats")
    }

    pub fn heartbeat_file(&self, agent_id: &str) -> PathBuf {
        self.heartbeats_dir().join(format!("{agent_id}.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file(&self, agent_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{agent_id}.log"))
    }

    pub fn tool_audit_file(&self) -> PathBuf {
        self.logs_dir().join("tool_audit.log")
    }

    pub fn daemon_lock(&self) -> PathBuf {
        self.root.join(".relayd.lock")
    }

    /// Create every directory the layout needs.
    pub fn ensure_layout(&self) -> io::Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join("mailboxes"),
            self.root.join(".mailboxes"),
            self.signals_dir(),
            self.heartbeats_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_stable() {
        let wd = WorkDir::new("/tmp/relay");
        assert_eq!(wd.board_file(), PathBuf::from("/tmp/relay/task_board.json"));
        assert_eq!(wd.board_lock(), PathBuf::from("/tmp/relay/.task_board.lock"));
        assert_eq!(
            wd.mailbox_file("jerry"),
            PathBuf::from("/tmp/relay/mailboxes/jerry.jsonl")
        );
        assert_eq!(
            wd.mailbox_lock("jerry"),
            PathBuf::from("/tmp/relay/.mailboxes/jerry.jsonl.lock")
        );
    }

    #[test]
    fn ensure_layout_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path().join("state"));
        wd.ensure_layout().unwrap();
        assert!(wd.signals_dir().is_dir());
        assert!(wd.heartbeats_dir().is_dir());
        assert!(wd.logs_dir().is_dir());
    }
}
