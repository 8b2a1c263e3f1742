//! Rolling-window estimate of the achieved capture rate

use std::collections::VecDeque;
use std::time::Instant;

/// Keeps the last `window` frame timestamps.
///
/// The rate is derived from the two window endpoints only:
/// `(len - 1) / (newest - oldest)`, or 0 with fewer than two samples.
#[derive(Debug, Clone)]
pub struct FpsTracker {
    window: VecDeque<Instant>,
    capacity: usize,
}

impl FpsTracker {
    /// Windows smaller than two samples cannot produce a rate and are bumped to two.
    pub fn new(window: usize) -> Self {
        let capacity = window.max(2);
        Self {
            window: VecDeque::new(),
            capacity,
        }
    }

    pub fn record(&mut self, timestamp: Instant) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(timestamp);
    }

    pub fn current_fps(&self) -> f64 {
        let (Some(oldest), Some(newest)) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };

        let span = newest.saturating_duration_since(*oldest).as_secs_f64();
        if self.window.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.window.len() - 1) as f64 / span
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
