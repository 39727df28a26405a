//! Cross-process advisory locks over sibling lockfiles.
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile with
//! the owner's PID inside. If two processes race, exactly one wins the create.
//! The loser checks whether the holder is still alive via `kill(pid, 0)` -
//! a lockfile whose owner is dead (crash, SIGKILL) is removed and the acquire
//! retried, so a crashed writer never wedges the board.
//!
//! The returned [`LockGuard`] removes the lockfile on drop.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default time to wait for a busy lock before giving up.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting on a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// A named lock backed by an exclusively-created file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock; the lockfile is removed when this guard drops.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is acquired or the timeout elapses.
    pub fn acquire(&self) -> io::Result<LockGuard> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true) // O_CREAT | O_EXCL - fails if file exists
                .open(&self.path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    let _ = file.sync_all();
                    return Ok(LockGuard {
                        path: self.path.clone(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if holder_is_dead(&self.path) {
                        tracing::warn!(
                            lock = %self.path.display(),
                            "removing stale lockfile (holder not running)"
                        );
                        let _ = std::fs::remove_file(&self.path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("lock {} held past timeout", self.path.display()),
                        ));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Parent directory missing - create it and retry.
                    if let Some(parent) = self.path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the PID stored in the lockfile and probe it.
///
/// An unreadable or not-yet-written PID counts as alive: the racing writer
/// may simply not have flushed yet, and a false "dead" here would break
/// mutual exclusion.
fn holder_is_dead(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => match contents.trim().parse::<u32>() {
            Ok(pid) => !pid_alive(pid),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // On non-Unix platforms, assume alive (conservative - avoids accidental cleanup).
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
