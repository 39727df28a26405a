//! Lock-guarded JSON documents with atomic replacement.
//!
//! Every shared resource (board, context bus, sub-task map) is a single JSON
//! document plus a sibling lockfile. Writers hold the lock for the whole
//! read-modify-write window; the new document is written to a temp file in
//! the same directory and renamed over the old one, so a crash mid-write
//! leaves the previous valid document intact.
//!
//! A document that exists but does not parse is corruption: loads fail loud
//! with [`StoreError::Corrupt`] and no mutation goes through until an
//! operator repairs the file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lockfile::{FileLock, LockGuard};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The on-disk document exists but is not valid JSON for its schema.
    #[error("document {path} is corrupt: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("failed to serialize document {path}: {detail}")]
    Serialize { path: String, detail: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// JsonStore
// ---------------------------------------------------------------------------

/// A typed JSON document on disk with a companion lockfile.
#[derive(Debug)]
pub struct JsonStore<T> {
    path: PathBuf,
    lock: FileLock,
    _marker: PhantomData<fn() -> T>,
}

// Manual impl: the store holds only paths, no `T: Clone` bound needed.
impl<T> Clone for JsonStore<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock: self.lock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: FileLock::new(lock_path),
            _marker: PhantomData,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock = self.lock.with_timeout(timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive writer lock. Hold the guard for the whole
    /// read-modify-write window.
    pub fn lock(&self) -> Result<LockGuard> {
        self.lock.acquire().map_err(|e| self.io_err(e))
    }

    /// Read the current document. A missing file is an empty default;
    /// an unparseable file is corruption.
    pub fn load(&self) -> Result<T> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Atomically replace the document: write-to-temp, fsync, rename.
    ///
    /// Callers must hold the lock from [`lock`](Self::lock).
    pub fn save(&self, doc: &T) -> Result<()> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|e| self.io_err(e))?;

        let json = serde_json::to_string_pretty(doc).map_err(|e| StoreError::Serialize {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(json.as_bytes()).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }

    /// Lock, load, apply `f`, save. For simple stores where the mutation
    /// cannot fail; the board uses `lock`/`load`/`save` directly so its
    /// validation errors abort before anything is written.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let _guard = self.lock()?;
        let mut doc = self.load()?;
        let out = f(&mut doc);
        self.save(&doc)?;
        Ok(out)
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
