//! Per-path pessimistic lock manager used by the sync collaborator to fence
//! writes during a LOCAL/EXTERNAL transfer.
//!
//! Grounded on the daemon's own flock-style lock table: a `Mutex`-guarded
//! map from path to holder, with an `Arc<Notify>` per entry so waiters can
//! be woken without polling. Generalized from shared/exclusive flock
//! semantics to the exclusive-only, directioned lock spec.md calls for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToExternal,
    ExternalToLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Timeout,
    Cancelled,
}

struct LockEntry {
    direction: Direction,
    source_path: String,
    acquired_at: Instant,
    notify: Arc<Notify>,
}

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LockManager {
    locks: Mutex<HashMap<String, LockEntry>>,
    lock_timeout: Duration,
    shutting_down: AtomicBool,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockManager {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            lock_timeout,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Inserts an exclusive lock for `virtual_path` if it is free. Returns
    /// `true` if the lock was acquired, `false` if it is already held.
    pub fn acquire(&self, virtual_path: &str, direction: Direction, source_path: &str) -> bool {
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(virtual_path) {
            return false;
        }
        locks.insert(
            virtual_path.to_string(),
            LockEntry {
                direction,
                source_path: source_path.to_string(),
                acquired_at: Instant::now(),
                notify: Arc::new(Notify::new()),
            },
        );
        true
    }

    /// Acquires as many of `paths` as are currently free; returns the
    /// subset actually acquired, in order. Does not roll back partial
    /// acquisition on a later failure — callers that need all-or-nothing
    /// release the returned subset themselves.
    pub fn acquire_many(
        &self,
        paths: &[String],
        direction: Direction,
        source_path: &str,
    ) -> Vec<String> {
        paths
            .iter()
            .filter(|p| self.acquire(p, direction, source_path))
            .cloned()
            .collect()
    }

    /// Releases the lock on `virtual_path`, waking all waiters with
    /// `Success`. A no-op if the path was not locked.
    pub fn release(&self, virtual_path: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.remove(virtual_path) {
            entry.notify.notify_waiters();
        }
    }

    pub fn is_locked(&self, virtual_path: &str) -> bool {
        self.locks.lock().unwrap().contains_key(virtual_path)
    }

    fn notify_handle(&self, virtual_path: &str) -> Option<Arc<Notify>> {
        self.locks
            .lock()
            .unwrap()
            .get(virtual_path)
            .map(|e| e.notify.clone())
    }

    /// Waits for `virtual_path` to become free, up to `timeout`. Re-checks
    /// the lock table on every wakeup before declaring success, since a
    /// `notify_waiters` call races with a new acquirer.
    pub async fn wait_for_unlock(&self, virtual_path: &str, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return WaitResult::Cancelled;
            }
            let notify = match self.notify_handle(virtual_path) {
                Some(n) => n,
                None => return WaitResult::Success,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitResult::Timeout;
            }
            tokio::select! {
                _ = notify.notified() => {
                    if !self.is_locked(virtual_path) {
                        return WaitResult::Success;
                    }
                    // Someone else grabbed it between notify and recheck; loop.
                }
                _ = tokio::time::sleep(remaining) => {
                    return WaitResult::Timeout;
                }
            }
        }
    }

    /// Releases any lock held longer than the configured timeout, waking
    /// its waiters as though the holder had released normally. Intended to
    /// be driven by a ticking background task (see `sweep_forever`).
    pub fn sweep_expired(&self) -> usize {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = locks
            .iter()
            .filter(|(_, e)| now.duration_since(e.acquired_at) >= self.lock_timeout)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &expired {
            if let Some(entry) = locks.remove(path) {
                entry.notify.notify_waiters();
            }
        }
        expired.len()
    }

    /// Runs `sweep_expired` on `interval` until the manager is shut down.
    pub async fn sweep_forever(self: &Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let n = self.sweep_expired();
            if n > 0 {
                tracing::warn!(component = "LOCK", count = n, "swept expired locks");
            }
        }
    }

    /// Releases every lock and wakes all waiters with `Cancelled`. Called
    /// once during unmount; idempotent.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut locks = self.locks.lock().unwrap();
        for (_, entry) in locks.drain() {
            entry.notify.notify_waiters();
        }
    }

    pub fn holder_direction(&self, virtual_path: &str) -> Option<Direction> {
        self.locks
            .lock()
            .unwrap()
            .get(virtual_path)
            .map(|e| e.direction)
    }

    pub fn holder_source(&self, virtual_path: &str) -> Option<String> {
        self.locks
            .lock()
            .unwrap()
            .get(virtual_path)
            .map(|e| e.source_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_release_unblocks_waiter() {
        let mgr = Arc::new(LockManager::default());
        assert!(mgr.acquire("/x.dat", Direction::ExternalToLocal, "/ext/x.dat"));
        assert!(!mgr.acquire("/x.dat", Direction::ExternalToLocal, "/ext/x.dat"));

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            mgr2.wait_for_unlock("/x.dat", Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.release("/x.dat");

        assert_eq!(waiter.await.unwrap(), WaitResult::Success);
        assert!(!mgr.is_locked("/x.dat"));
    }

    #[tokio::test]
    async fn wait_times_out_when_never_released() {
        let mgr = Arc::new(LockManager::default());
        mgr.acquire("/x.dat", Direction::LocalToExternal, "/local/x.dat");
        let result = mgr
            .wait_for_unlock("/x.dat", Duration::from_millis(30))
            .await;
        assert_eq!(result, WaitResult::Timeout);
    }

    #[tokio::test]
    async fn sweep_expires_stale_locks() {
        let mgr = LockManager::new(Duration::from_millis(10));
        mgr.acquire("/x.dat", Direction::LocalToExternal, "/local/x.dat");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let swept = mgr.sweep_expired();
        assert_eq!(swept, 1);
        assert!(!mgr.is_locked("/x.dat"));
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let mgr = Arc::new(LockManager::default());
        mgr.acquire("/x.dat", Direction::LocalToExternal, "/local/x.dat");

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            mgr2.wait_for_unlock("/x.dat", Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.shutdown();

        assert_eq!(waiter.await.unwrap(), WaitResult::Cancelled);
    }

    #[test]
    fn acquire_many_returns_only_the_acquired_subset() {
        let mgr = LockManager::default();
        mgr.acquire("/b", Direction::LocalToExternal, "/local/b");
        let acquired = mgr.acquire_many(
            &["/a".to_string(), "/b".to_string(), "/c".to_string()],
            Direction::LocalToExternal,
            "/local",
        );
        assert_eq!(acquired, vec!["/a".to_string(), "/c".to_string()]);
    }
}
