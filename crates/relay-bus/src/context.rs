//! Shared layered KV store with TTL and provenance.
//!
//! Every agent reads a snapshot at the start of each task; the snapshot is
//! injected into its system prompt for cross-agent awareness. Keys are
//! namespaced `"{agent_id}:{key}"`. Entries carry a layer with a default
//! TTL, an explicit TTL override, and provenance describing where the value
//! came from.
//!
//! Layers:
//! - `TASK`    - cleared explicitly when the current root task terminates
//! - `SESSION` - TTL 3600 s
//! - `SHORT`   - TTL 86400 s (default)
//! - `LONG`    - permanent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use relay_core::paths::WorkDir;
use relay_core::store::{JsonStore, Result};
use relay_core::types::unix_seconds;

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContextLayer {
    Task,
    Session,
    Short,
    Long,
}

impl ContextLayer {
    /// Layer-derived TTL in seconds; `None` means no automatic expiry.
    pub fn default_ttl(&self) -> Option<f64> {
        match self {
            ContextLayer::Task => None, // cleared explicitly on task terminal
            ContextLayer::Session => Some(3_600.0),
            ContextLayer::Short => Some(86_400.0),
            ContextLayer::Long => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Where a context value came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// "user" | "agent" | "task" | "system"
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub source_agent: Option<String>,
    #[serde(default)]
    pub source_channel: Option<String>,
    #[serde(default)]
    pub source_task_id: Option<String>,
}

impl Provenance {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            kind: "agent".into(),
            source_agent: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn user(channel: impl Into<String>) -> Self {
        Self {
            kind: "user".into(),
            source_channel: Some(channel.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub value: serde_json::Value,
    pub layer: ContextLayer,
    #[serde(default)]
    pub ttl_seconds: Option<f64>,
    #[serde(with = "unix_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub provenance: Provenance,
}

impl ContextEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            None => false,
            Some(ttl) => (now - self.timestamp).num_milliseconds() as f64 / 1_000.0 > ttl,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContextDocument {
    #[serde(default)]
    pub entries: BTreeMap<String, ContextEntry>,
}

// ---------------------------------------------------------------------------
// ContextBus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContextBus {
    store: JsonStore<ContextDocument>,
}

impl ContextBus {
    pub fn new(workdir: &WorkDir) -> Self {
        Self {
            store: JsonStore::new(workdir.context_bus_file(), workdir.context_bus_lock()),
        }
    }

    /// Insert or update `{agent_id}:{key}`. An explicit `ttl` overrides the
    /// layer default.
    pub fn publish(
        &self,
        agent_id: &str,
        key: &str,
        value: serde_json::Value,
        layer: ContextLayer,
        ttl: Option<f64>,
        provenance: Provenance,
    ) -> Result<()> {
        let ns_key = format!("{agent_id}:{key}");
        let entry = ContextEntry {
            value,
            layer,
            ttl_seconds: ttl.or_else(|| layer.default_ttl()),
            timestamp: Utc::now(),
            provenance,
        };
        self.store.update(move |doc| {
            doc.entries.insert(ns_key, entry);
        })
    }

    /// Read one entry; expired entries are pruned lazily and read as absent.
    pub fn get(&self, agent_id: &str, key: &str) -> Result<Option<ContextEntry>> {
        let ns_key = format!("{agent_id}:{key}");
        let doc = self.store.load()?;
        let now = Utc::now();
        match doc.entries.get(&ns_key) {
            Some(entry) if entry.is_expired(now) => {
                // Lazy prune; best-effort, a concurrent writer may win.
                let _ = self.store.update(|doc| {
                    doc.entries.remove(&ns_key);
                });
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    /// All unexpired entries, for prompt injection.
    pub fn snapshot(&self) -> Result<BTreeMap<String, ContextEntry>> {
        let now = Utc::now();
        Ok(self
            .store
            .load()?
            .entries
            .into_iter()
            .filter(|(_, e)| !e.is_expired(now))
            .collect())
    }

    /// Remove all TASK-layer entries. Called when a root task terminates.
    pub fn clear_task_layer(&self) -> Result<usize> {
        self.store.update(|doc| {
            let before = doc.entries.len();
            doc.entries.retain(|_, e| e.layer != ContextLayer::Task);
            before - doc.entries.len()
        })
    }

    /// Purge expired entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        self.store.update(move |doc| {
            let before = doc.entries.len();
            doc.entries.retain(|_, e| !e.is_expired(now));
            before - doc.entries.len()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus_in(dir: &std::path::Path) -> ContextBus {
        ContextBus::new(&WorkDir::new(dir))
    }

    #[test]
    fn publish_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());

        bus.publish(
            "planner",
            "goal",
            json!("ship it"),
            ContextLayer::Short,
            None,
            Provenance::agent("planner"),
        )
        .unwrap();

        let entry = bus.get("planner", "goal").unwrap().unwrap();
        assert_eq!(entry.value, json!("ship it"));
        assert_eq!(entry.ttl_seconds, Some(86_400.0));
        assert_eq!(entry.provenance.source_agent.as_deref(), Some("planner"));
    }

    #[test]
    fn explicit_ttl_overrides_layer_default() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());
        bus.publish(
            "a",
            "k",
            json!(1),
            ContextLayer::Session,
            Some(5.0),
            Provenance::default(),
        )
        .unwrap();
        let entry = bus.get("a", "k").unwrap().unwrap();
        assert_eq!(entry.ttl_seconds, Some(5.0));
    }

    #[test]
    fn expired_entry_reads_as_absent_and_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());
        bus.publish(
            "a",
            "stale",
            json!("old"),
            ContextLayer::Session,
            Some(0.0),
            Provenance::default(),
        )
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bus.get("a", "stale").unwrap().is_none());
        assert!(bus.snapshot().unwrap().is_empty());
    }

    #[test]
    fn task_layer_cleared_explicitly_not_by_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());
        bus.publish(
            "system",
            "intent:t1",
            json!("original ask"),
            ContextLayer::Task,
            None,
            Provenance::user("cli"),
        )
        .unwrap();
        bus.publish(
            "a",
            "note",
            json!("keep"),
            ContextLayer::Long,
            None,
            Provenance::default(),
        )
        .unwrap();

        assert_eq!(bus.cleanup_expired().unwrap(), 0);
        assert_eq!(bus.clear_task_layer().unwrap(), 1);
        assert!(bus.get("system", "intent:t1").unwrap().is_none());
        assert!(bus.get("a", "note").unwrap().is_some());
    }

    #[test]
    fn snapshot_keys_are_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());
        bus.publish(
            "executor",
            "progress",
            json!("50%"),
            ContextLayer::Short,
            None,
            Provenance::agent("executor"),
        )
        .unwrap();

        let snap = bus.snapshot().unwrap();
        assert!(snap.contains_key("executor:progress"));
    }
}
