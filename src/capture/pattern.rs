//! Synthetic moving-gradient source for demos and hardware-free runs

use std::thread;
use std::time::{Duration, Instant};

use crate::capture::device::{CaptureBackend, DeviceHandle, RawImage};
use crate::capture::frame::PixelFormat;
use crate::error::DeviceError;
use crate::Resolution;

/// Backend producing a scrolling RGB gradient at a fixed rate.
#[derive(Debug, Clone)]
pub struct TestPattern {
    fps: f64,
}

impl TestPattern {
    pub fn new(fps: f64) -> Self {
        Self { fps }
    }
}

impl Default for TestPattern {
    fn default() -> Self {
        Self::new(30.0)
    }
}

impl CaptureBackend for TestPattern {
    type Handle = PatternHandle;

    fn open(&self, source_id: &str, requested: Resolution) -> Result<PatternHandle, DeviceError> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(DeviceError::Open {
                source_id: source_id.to_string(),
                reason: format!("invalid pattern rate {}", self.fps),
            });
        }

        tracing::debug!(source_id, ?requested, "opened test pattern");
        Ok(PatternHandle {
            resolution: requested,
            interval: Duration::from_secs_f64(1.0 / self.fps),
            next_due: Instant::now(),
            tick: 0,
        })
    }
}

pub struct PatternHandle {
    resolution: Resolution,
    interval: Duration,
    next_due: Instant,
    tick: u32,
}

impl PatternHandle {
    fn render(&self) -> Vec<u8> {
        let Resolution { width, height } = self.resolution;
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                let r = (x.wrapping_add(self.tick) % 256) as u8;
                let g = (y.wrapping_add(self.tick / 2) % 256) as u8;
                let b = (self.tick % 256) as u8;
                data.extend_from_slice(&[r, g, b]);
            }
        }
        data
    }
}

impl DeviceHandle for PatternHandle {
    fn read(&mut self, timeout: Duration) -> Result<RawImage, DeviceError> {
        let now = Instant::now();
        let wait = self.next_due.saturating_duration_since(now);
        if wait > timeout {
            thread::sleep(timeout);
            return Err(DeviceError::Timeout(timeout));
        }
        thread::sleep(wait);

        self.next_due = self.next_due.max(now) + self.interval;
        self.tick = self.tick.wrapping_add(1);

        Ok(RawImage {
            data: self.render(),
            width: self.resolution.width,
            height: self.resolution.height,
            format: PixelFormat::Rgb24,
        })
    }

    fn nominal_fps(&self) -> Option<f64> {
        Some(1.0 / self.interval.as_secs_f64())
    }
}

impl Drop for PatternHandle {
    fn drop(&mut self) {
        tracing::debug!(frames = self.tick, "closed test pattern");
    }
}
