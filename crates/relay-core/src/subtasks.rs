//! Parent→children close-out registry.
//!
//! When a planner decomposes a task, the parent→children mapping is recorded
//! here (`subtasks.json`) rather than on the tasks themselves; the planner
//! polls it to know which close-outs are still owed. Entries are removed
//! once the parent's synthesis completes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::paths::WorkDir;
use crate::store::{JsonStore, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubtaskDocument {
    #[serde(default)]
    pub parents: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SubtaskMap {
    store: JsonStore<SubtaskDocument>,
}

impl SubtaskMap {
    pub fn new(workdir: &WorkDir) -> Self {
        Self {
            store: JsonStore::new(workdir.subtasks_file(), workdir.subtasks_lock()),
        }
    }

    /// Record that `parent` is waiting on `children` for close-out.
    pub fn register(&self, parent: &str, children: Vec<String>) -> Result<()> {
        let parent = parent.to_string();
        self.store.update(move |doc| {
            doc.parents.insert(parent, children);
        })
    }

    pub fn children_of(&self, parent: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .load()?
            .parents
            .get(parent)
            .cloned()
            .unwrap_or_default())
    }

    /// All parents with a close-out still owed.
    pub fn pending_parents(&self) -> Result<Vec<String>> {
        Ok(self.store.load()?.parents.keys().cloned().collect())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.store.load()?.parents.is_empty())
    }

    /// Drop a parent once its close-out has been synthesized.
    pub fn remove(&self, parent: &str) -> Result<()> {
        let parent = parent.to_string();
        self.store.update(move |doc| {
            doc.parents.remove(&parent);
        })
    }

    /// Transitive descendants of a root (children, grandchildren, ...).
    pub fn descendants_of(&self, root: &str) -> Result<Vec<String>> {
        let doc = self.store.load()?;
        let mut out = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(children) = doc.parents.get(&id) {
                for child in children {
                    if !out.contains(child) {
                        out.push(child.clone());
                        stack.push(child.clone());
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let map = SubtaskMap::new(&WorkDir::new(dir.path()));

        assert!(map.is_empty().unwrap());
        map.register("p1", vec!["c1".into(), "c2".into()]).unwrap();
        assert_eq!(map.children_of("p1").unwrap().len(), 2);
        assert_eq!(map.pending_parents().unwrap(), vec!["p1".to_string()]);

        map.remove("p1").unwrap();
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn descendants_walk_transitively() {
        let dir = tempfile::tempdir().unwrap();
        let map = SubtaskMap::new(&WorkDir::new(dir.path()));
        map.register("root", vec!["a".into(), "b".into()]).unwrap();
        map.register("a", vec!["a1".into()]).unwrap();

        let mut all = map.descendants_of("root").unwrap();
        all.sort();
        assert_eq!(all, vec!["a".to_string(), "a1".into(), "b".into()]);
    }
}
