//! Edge-triggered wakeup across worker processes.
//!
//! Idle workers block on [`WakeupBus::wait`] instead of sleeping through
//! their whole backoff. `notify()` raises two edges: an in-process broadcast
//! (instant for same-process waiters) and a zero-byte signal file in
//! `task_signals/` that other processes observe on their next poll slice.
//!
//! Semantics: a wait is woken at least once per notify, multiple notifies
//! may coalesce into a single wake, and signal files are consumed (deleted)
//! by the waiter that observes them. Reception is best-effort - correctness
//! never depends on a signal arriving.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

/// Granularity of the cross-process signal-file poll.
const POLL_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WakeupBus {
    dir: PathBuf,
    edge: broadcast::Sender<()>,
}

impl WakeupBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let _ = std::fs::create_dir_all(&dir);
        let (edge, _) = broadcast::channel(8);
        Self { dir, edge }
    }

    /// Set the event: wake in-process waiters immediately and drop a signal
    /// file for waiters in other processes.
    pub fn notify(&self) {
        let _ = self.edge.send(());
        let marker = self.dir.join(format!("sig-{}", Uuid::new_v4()));
        if let Err(e) = std::fs::write(&marker, b"") {
            tracing::debug!(error = %e, "wakeup signal file not written");
        }
    }

    /// Block until notified or `timeout` elapses, then clear. Returns `true`
    /// when woken by a notify.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.edge.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.consume_signals() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = POLL_SLICE.min(deadline - now);
            match tokio::time::timeout(slice, rx.recv()).await {
                Ok(Ok(())) => {
                    // Level reset: also consume any files this notify dropped.
                    self.consume_signals();
                    return true;
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    self.consume_signals();
                    return true;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    // Timeout slice elapsed; loop re-checks the signal dir.
                }
            }
        }
    }

    /// Delete all pending signal files, reporting whether any existed.
    fn consume_signals(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return false;
        };
        let mut any = false;
        for entry in entries.flatten() {
            if std::fs::remove_file(entry.path()).is_ok() {
                any = true;
            }
        }
        any
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WakeupBus::new(dir.path());
        let waiter = bus.clone();

        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.notify();

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_without_notify() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WakeupBus::new(dir.path());
        assert!(!bus.wait(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn signal_file_wakes_fresh_bus() {
        let dir = tempfile::tempdir().unwrap();
        // Simulates another process: a different bus instance over the same dir.
        let sender = WakeupBus::new(dir.path());
        sender.notify();

        let receiver = WakeupBus::new(dir.path());
        assert!(receiver.wait(Duration::from_secs(2)).await);
        // Consumed: a second wait sees nothing.
        assert!(!receiver.wait(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn multiple_notifies_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WakeupBus::new(dir.path());
        bus.notify();
        bus.notify();
        bus.notify();

        assert!(bus.wait(Duration::from_millis(500)).await);
        assert!(!bus.wait(Duration::from_millis(50)).await);
    }
}
