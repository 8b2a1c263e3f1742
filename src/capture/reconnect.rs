//! Connection state machine and capped exponential backoff

use std::time::{Duration, Instant};

/// Lifecycle of the device connection as seen by the capture worker.
///
/// `Disconnected -> Connecting -> Streaming -> Backoff -> Connecting -> ...`;
/// `Stopped` is terminal and only reached through an explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
    Stopped,
}

impl CaptureState {
    pub fn is_live(self) -> bool {
        self == CaptureState::Streaming
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CaptureState::Disconnected => 0,
            CaptureState::Connecting => 1,
            CaptureState::Streaming => 2,
            CaptureState::Backoff => 3,
            CaptureState::Stopped => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CaptureState::Connecting,
            2 => CaptureState::Streaming,
            3 => CaptureState::Backoff,
            4 => CaptureState::Stopped,
            _ => CaptureState::Disconnected,
        }
    }
}

/// Retry bookkeeping for a flaky device.
///
/// Each failed connection attempt doubles the wait before the next one, up to
/// `max_delay`. The first successful read resets the counter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    state: CaptureState,
    attempts: u32,
    last_attempt: Option<Instant>,
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: CaptureState::Disconnected,
            attempts: 0,
            last_attempt: None,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Failed connection attempts since the last successful read
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// `min(base * 2^attempts, max_delay)`
    pub fn delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Disconnected/Backoff -> Connecting. Returns false in any other state.
    pub fn begin_connect(&mut self, now: Instant) -> bool {
        match self.state {
            CaptureState::Disconnected | CaptureState::Backoff => {
                self.state = CaptureState::Connecting;
                self.last_attempt = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Connecting -> Streaming once the device opened and delivered a first frame.
    pub fn connected(&mut self) {
        if self.state == CaptureState::Connecting {
            self.state = CaptureState::Streaming;
            self.attempts = 0;
        }
    }

    /// Connecting -> Backoff after the open or the first read failed.
    pub fn connect_failed(&mut self) -> Duration {
        if self.state == CaptureState::Connecting {
            self.attempts = self.attempts.saturating_add(1);
            self.state = CaptureState::Backoff;
        }
        self.delay()
    }

    /// Streaming -> Backoff after a read failed or the device went away.
    pub fn read_failed(&mut self) -> Duration {
        if self.state == CaptureState::Streaming {
            self.state = CaptureState::Backoff;
        }
        self.delay()
    }

    /// Any state -> Stopped
    pub fn stop(&mut self) {
        self.state = CaptureState::Stopped;
    }
}
