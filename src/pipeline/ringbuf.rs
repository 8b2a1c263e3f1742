//! Latest-frames buffer shared between the capture worker and consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::Frame;

/// Fixed-capacity frame store that evicts the oldest frame on overflow.
///
/// Only the writer locks the ring. Readers go through atomic pointer swaps:
/// the newest frame and the retained set are republished on every push, so a
/// reader sees either the previous complete state or the new one and can
/// never hold up the writer.
pub struct BoundedFrameBuffer {
    /// Retained frames, oldest first
    ring: Mutex<HeapRb<Arc<Frame>>>,

    /// Newest frame, readable without locking
    latest: ArcSwapOption<Frame>,

    /// Copy of the ring's contents as of the last push
    retained: ArcSwap<Vec<Arc<Frame>>>,

    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_evicted: AtomicU64,
}

/// Counters reported by [`BoundedFrameBuffer::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub frames_written: u64,
    pub frames_evicted: u64,
}

impl BoundedFrameBuffer {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            latest: ArcSwapOption::empty(),
            retained: ArcSwap::from_pointee(Vec::new()),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<Arc<Frame>>> {
        // Only the writer side locks; a panic there cannot leave the ring half-written.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: insert a frame, evicting the oldest one when full. Never blocks on readers.
    pub fn push(&self, frame: Frame) -> Arc<Frame> {
        let frame = Arc::new(frame);

        let mut ring = self.ring();
        if ring.is_full() {
            self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("aquarium_buffer_evicted_total").increment(1);
        }
        ring.push_overwrite(Arc::clone(&frame));
        self.retained.store(Arc::new(ring.iter().cloned().collect()));
        self.latest.store(Some(Arc::clone(&frame)));
        drop(ring);

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        frame
    }

    /// Consumer: the most recently pushed frame, without removing anything.
    pub fn pop_latest(&self) -> Option<Arc<Frame>> {
        self.latest.load_full()
    }

    /// Retained frames, oldest first
    pub fn snapshot(&self) -> Vec<Arc<Frame>> {
        self.retained.load().as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.retained.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.load().is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut ring = self.ring();
        while ring.try_pop().is_some() {}
        self.retained.store(Arc::new(Vec::new()));
        self.latest.store(None);
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BoundedFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedFrameBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
