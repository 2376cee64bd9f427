//! Bounded per-direction audio queues
//!
//! Audio that cannot be delivered in time is worthless, so a full queue
//! evicts its oldest entry instead of blocking the reader. Evictions are
//! counted for the call summary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use callrelay_codec_core::AudioFrame;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Drop-oldest FIFO shared between one producer task and one consumer task
#[derive(Debug)]
pub struct FrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an item, returning the evicted oldest item if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next item; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Discard everything queued, returning how many items were removed
    pub fn purge(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }

    /// Discard queued items matching `predicate`
    pub fn purge_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| !predicate(item));
        before - items.len()
    }

    /// Stop accepting items and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Entry in the caller-bound queue
///
/// Every entry records the interruption generation it was produced in so a
/// barge-in can invalidate audio already queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundItem {
    /// One 20 ms telephony frame
    Audio { frame: AudioFrame, generation: u64 },
    /// Playback marker sent after the last frame of a response
    Mark { name: String, generation: u64 },
}

impl OutboundItem {
    pub fn generation(&self) -> u64 {
        match self {
            OutboundItem::Audio { generation, .. } | OutboundItem::Mark { generation, .. } => *generation,
        }
    }
}
