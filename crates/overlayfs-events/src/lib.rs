//! Bounded async event queue (C6): callbacks enqueue without blocking; a
//! background worker thread drains the queue and invokes upstream
//! observers. Overflow drops the oldest record and increments a counter.
//!
//! Events may be coalesced across paths, but ordering on a single path is
//! preserved because callers enqueue in the order the kernel delivered
//! them and the queue is FIFO.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone)]
pub enum EventKind {
    Created,
    Deleted,
    Written,
    Read,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub kind: EventKind,
    pub path: String,
    pub path2: Option<String>,
    pub is_dir: bool,
}

impl EventRecord {
    pub fn created(path: impl Into<String>, is_dir: bool) -> Self {
        Self {
            kind: EventKind::Created,
            path: path.into(),
            path2: None,
            is_dir,
        }
    }

    pub fn deleted(path: impl Into<String>, is_dir: bool) -> Self {
        Self {
            kind: EventKind::Deleted,
            path: path.into(),
            path2: None,
            is_dir,
        }
    }

    pub fn written(path: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Written,
            path: path.into(),
            path2: None,
            is_dir: false,
        }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Read,
            path: path.into(),
            path2: None,
            is_dir: false,
        }
    }

    pub fn renamed(from: impl Into<String>, to: impl Into<String>, is_dir: bool) -> Self {
        Self {
            kind: EventKind::Renamed,
            path: from.into(),
            path2: Some(to.into()),
            is_dir,
        }
    }
}

/// The upstream notification surface: index writers and UI observers
/// implement this and register with the worker.
pub trait EventObserver: Send + Sync {
    fn on_created(&self, vp: &str, is_dir: bool);
    fn on_deleted(&self, vp: &str, is_dir: bool);
    fn on_written(&self, vp: &str);
    fn on_read(&self, vp: &str);
    fn on_renamed(&self, from: &str, to: &str, is_dir: bool);
}

fn dispatch(observer: &dyn EventObserver, record: &EventRecord) {
    match record.kind {
        EventKind::Created => observer.on_created(&record.path, record.is_dir),
        EventKind::Deleted => observer.on_deleted(&record.path, record.is_dir),
        EventKind::Written => observer.on_written(&record.path),
        EventKind::Read => observer.on_read(&record.path),
        EventKind::Renamed => {
            let to = record.path2.as_deref().unwrap_or_default();
            observer.on_renamed(&record.path, to, record.is_dir)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueCounters {
    pub queued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub pending: u64,
}

struct Inner {
    ring: ArrayQueue<EventRecord>,
    queued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    wake: Condvar,
    wake_gate: Mutex<bool>,
}

/// A bounded, drop-oldest event queue with a dedicated draining thread.
/// Started on mount, joined on unmount (per spec.md §4.6 / §5).
pub struct EventQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                ring: ArrayQueue::new(capacity),
                queued: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                wake: Condvar::new(),
                wake_gate: Mutex::new(false),
            }),
            worker: Mutex::new(None),
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Enqueues without blocking. On overflow, drops the oldest record and
    /// increments the dropped counter before pushing.
    pub fn enqueue(&self, record: EventRecord) {
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(record) = self.inner.ring.push(record) {
            let _ = self.inner.ring.pop();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.ring.push(record);
        }
        let mut gate = self.inner.wake_gate.lock().unwrap();
        *gate = true;
        self.inner.wake.notify_one();
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            queued: self.inner.queued.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            pending: self.inner.ring.len() as u64,
        }
    }

    /// Spawns the draining worker thread. Returns immediately; the thread
    /// runs until [`EventQueue::shutdown`] is called.
    pub fn start(&self, observer: Arc<dyn EventObserver>) {
        let inner = self.inner.clone();
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("overlayfs-events".into())
            .spawn(move || {
                loop {
                    if let Some(record) = inner.ring.pop() {
                        dispatch(observer.as_ref(), &record);
                        inner.processed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    let gate = inner.wake_gate.lock().unwrap();
                    let (mut gate, _) = inner
                        .wake
                        .wait_timeout(gate, Duration::from_millis(200))
                        .unwrap();
                    *gate = false;
                }
            })
            .expect("spawn event worker thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Signals the worker to stop and joins it, draining a short grace
    /// window of already-queued events first (per spec.md §5: "drains up
    /// to a short grace window before being joined").
    pub fn shutdown(&self) {
        std::thread::sleep(Duration::from_millis(50));
        self.stop.store(true, Ordering::Release);
        let mut gate = self.inner.wake_gate.lock().unwrap();
        *gate = true;
        self.inner.wake.notify_one();
        drop(gate);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        events: StdMutex<Vec<String>>,
    }

    impl EventObserver for RecordingObserver {
        fn on_created(&self, vp: &str, _is_dir: bool) {
            self.events.lock().unwrap().push(format!("created:{vp}"));
        }
        fn on_deleted(&self, vp: &str, _is_dir: bool) {
            self.events.lock().unwrap().push(format!("deleted:{vp}"));
        }
        fn on_written(&self, vp: &str) {
            self.events.lock().unwrap().push(format!("written:{vp}"));
        }
        fn on_read(&self, vp: &str) {
            self.events.lock().unwrap().push(format!("read:{vp}"));
        }
        fn on_renamed(&self, from: &str, to: &str, _is_dir: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("renamed:{from}->{to}"));
        }
    }

    #[test]
    fn drains_events_in_order() {
        let queue = EventQueue::new(16);
        let observer = Arc::new(RecordingObserver {
            events: StdMutex::new(Vec::new()),
        });
        queue.start(observer.clone());

        queue.enqueue(EventRecord::created("/a.txt", false));
        queue.enqueue(EventRecord::written("/a.txt"));
        queue.enqueue(EventRecord::deleted("/a.txt", false));

        std::thread::sleep(Duration::from_millis(100));
        queue.shutdown();

        let events = observer.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                "created:/a.txt".to_string(),
                "written:/a.txt".to_string(),
                "deleted:/a.txt".to_string(),
            ]
        );
    }

    #[test]
    fn overflow_drops_oldest_and_increments_counter() {
        let queue = EventQueue::new(2);
        queue.enqueue(EventRecord::created("/1", false));
        queue.enqueue(EventRecord::created("/2", false));
        queue.enqueue(EventRecord::created("/3", false));

        let counters = queue.counters();
        assert_eq!(counters.dropped, 1);
        assert_eq!(counters.pending, 2);
    }

    #[test]
    fn counters_track_queued_and_processed() {
        let queue = EventQueue::new(16);
        let observer = Arc::new(RecordingObserver {
            events: StdMutex::new(Vec::new()),
        });
        queue.start(observer);
        for i in 0..5 {
            queue.enqueue(EventRecord::created(format!("/{i}"), false));
        }
        std::thread::sleep(Duration::from_millis(100));
        queue.shutdown();

        let counters = queue.counters();
        assert_eq!(counters.queued, 5);
        assert_eq!(counters.processed, 5);
        assert_eq!(counters.pending, 0);
    }
}
