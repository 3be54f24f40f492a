use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use kubestream_types::LineEvent;

/// Bounded per-tailer queue between the log reader and the outbound channel
///
/// Pushing never blocks: when full, the oldest line is dropped and counted.
#[derive(Clone)]
pub struct TailQueue {
    inner: Arc<Inner>,
}

struct Inner {
    lines: Mutex<VecDeque<LineEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl TailQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a line; returns true if an older line had to be dropped
    pub fn push(&self, event: LineEvent) -> bool {
        let evicted = {
            let mut lines = self.inner.lines.lock();
            let evicted = if lines.len() >= self.inner.capacity {
                lines.pop_front();
                true
            } else {
                false
            };
            lines.push_back(event);
            evicted
        };

        if evicted {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.notify.notify_one();
        evicted
    }

    /// Wait for the next line; None once closed and drained
    pub async fn pop(&self) -> Option<LineEvent> {
        loop {
            let next = self.inner.lines.lock().pop_front();
            if next.is_some() {
                return next;
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// No more lines will be pushed
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
