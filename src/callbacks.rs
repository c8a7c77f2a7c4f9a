// src/callbacks.rs
use crate::event_loop::EventLoop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sentinel slot for an entry that is not (or no longer) in the heap.
const NOT_QUEUED: usize = usize::MAX;

/// Handle to a scheduled callback. Cancelling is idempotent and safe from any
/// thread: on the loop thread the entry is removed from the heap in O(log n),
/// elsewhere it is flagged and skipped when it surfaces.
#[derive(Clone)]
pub struct CallbackHandle {
    state: Arc<CallbackState>,
}

pub(crate) struct CallbackState {
    cancelled: AtomicBool,
    // Heap index, maintained by every swap. Only the loop thread writes it.
    slot: AtomicUsize,
}

impl CallbackHandle {
    /// Cancel the callback. Returns true if it had not yet fired.
    pub fn cancel(&self) -> bool {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(lp) = EventLoop::try_current() {
            return lp.remove_callback(&self.state);
        }
        self.state.slot.load(Ordering::SeqCst) != NOT_QUEUED
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// One scheduled callback: fire time, insertion sequence (tie-break), shared
/// cancellation state, and the closure itself.
pub(crate) struct Entry {
    at: Instant,
    seq: u64,
    state: Arc<CallbackState>,
    f: Box<dyn FnOnce()>,
}

impl Entry {
    #[inline]
    pub(crate) fn cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn run(self) {
        (self.f)();
    }

    #[inline]
    fn key(&self) -> (Instant, u64) {
        (self.at, self.seq)
    }
}

/// Binary min-heap of timed callbacks ordered by fire time, insertion order
/// breaking ties. Entries carry their heap index so removal by handle stays
/// O(log n).
pub(crate) struct CallbackQueue {
    heap: Vec<Entry>,
    seq: u64,
}

impl CallbackQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Vec::new(),
            seq: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn push(&mut self, at: Instant, f: Box<dyn FnOnce()>) -> CallbackHandle {
        let state = Arc::new(CallbackState {
            cancelled: AtomicBool::new(false),
            slot: AtomicUsize::new(self.heap.len()),
        });
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Entry {
            at,
            seq,
            state: state.clone(),
            f,
        });
        self.sift_up(self.heap.len() - 1);
        CallbackHandle { state }
    }

    /// Fire time of the head entry.
    #[inline]
    pub(crate) fn first_at(&self) -> Option<Instant> {
        self.heap.first().map(|e| e.at)
    }

    /// Whether the head entry is due. May be true for a cancelled head; the
    /// fire loop skips those when popping.
    #[inline]
    pub(crate) fn due(&self, now: Instant) -> bool {
        matches!(self.first_at(), Some(at) if at <= now)
    }

    #[inline]
    pub(crate) fn head_cancelled(&self) -> bool {
        self.heap.first().map(Entry::cancelled).unwrap_or(false)
    }

    /// Time until the head fires, clamped at zero.
    #[inline]
    pub(crate) fn until_first(&self, now: Instant) -> Option<Duration> {
        self.first_at().map(|at| at.saturating_duration_since(now))
    }

    pub(crate) fn pop(&mut self) -> Option<Entry> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Remove the entry belonging to `state`. The entry is returned rather
    /// than dropped so the caller can release its lock on the queue first:
    /// dropping a callback closure can re-enter the queue.
    pub(crate) fn remove(&mut self, state: &Arc<CallbackState>) -> Option<Entry> {
        let slot = state.slot.load(Ordering::SeqCst);
        if slot == NOT_QUEUED || slot >= self.heap.len() {
            return None;
        }
        if !Arc::ptr_eq(&self.heap[slot].state, state) {
            return None;
        }
        Some(self.remove_at(slot))
    }

    /// Empty the heap, handing the entries back for the caller to drop
    /// outside any lock on the queue.
    pub(crate) fn take_all(&mut self) -> Vec<Entry> {
        for entry in &self.heap {
            entry.state.slot.store(NOT_QUEUED, Ordering::SeqCst);
        }
        std::mem::take(&mut self.heap)
    }

    fn remove_at(&mut self, slot: usize) -> Entry {
        let last = self.heap.len() - 1;
        self.heap.swap(slot, last);
        let entry = self.heap.pop().expect("heap is non-empty");
        entry.state.slot.store(NOT_QUEUED, Ordering::SeqCst);
        if slot < self.heap.len() {
            self.heap[slot].state.slot.store(slot, Ordering::SeqCst);
            self.sift_up(slot);
            self.sift_down(slot);
        }
        entry
    }

    fn sift_up(&mut self, mut i: usize) {
        self.heap[i].state.slot.store(i, Ordering::SeqCst);
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].key() >= self.heap[parent].key() {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.heap.len() && self.heap[child].key() < self.heap[smallest].key() {
                    smallest = child;
                }
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    #[inline]
    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap[a].state.slot.store(a, Ordering::SeqCst);
        self.heap[b].state.slot.store(b, Ordering::SeqCst);
    }
}
