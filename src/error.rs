//! Error types for the capture core

use std::time::Duration;

use thiserror::Error;

use crate::capture::PixelFormat;

/// Rejected configuration, reported synchronously by `WebcamCapture::start`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {width}x{height}")]
    InvalidResolution {
        field: &'static str,
        width: u32,
        height: u32,
    },

    #[error("target_fps must be a finite number of at least {min}, got {0}", min = crate::MIN_TARGET_FPS)]
    InvalidFps(f64),

    #[error("buffer_capacity must be at least 1")]
    ZeroCapacity,

    #[error("buffer_capacity must be at most {max}, got {0}", max = crate::MAX_BUFFER_CAPACITY)]
    CapacityTooLarge(usize),

    #[error("fps_window must hold at least 2 samples, got {0}")]
    FpsWindowTooSmall(usize),

    #[error("fps_window must hold at most {max} samples, got {0}", max = crate::MAX_FPS_WINDOW)]
    FpsWindowTooLarge(usize),

    #[error("{field} must be non-zero")]
    ZeroDuration { field: &'static str },

    #[error("reconnect_max_delay ({max:?}) is shorter than reconnect_base_delay ({base:?})")]
    BackoffRange { base: Duration, max: Duration },

    #[error("read_timeout ({read:?}) must be shorter than stop_timeout ({stop:?})")]
    ReadTimeoutTooLong { read: Duration, stop: Duration },

    #[error("source must not be empty")]
    EmptySource,
}

/// Errors surfaced by the facade to its caller.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid capture configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("capture is already running")]
    AlreadyStarted,

    #[error("failed to spawn capture worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failures of the device primitive. These never leave the capture worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("failed to open {source_id}: {reason}")]
    Open { source_id: String, reason: String },

    #[error("read failed: {0}")]
    Read(String),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("device disconnected")]
    Disconnected,

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("{format:?} frame of {width}x{height} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("frame dimensions must be non-zero, got {width}x{height}")]
    Empty { width: u32, height: u32 },
}

impl From<FrameError> for DeviceError {
    fn from(err: FrameError) -> Self {
        DeviceError::Decode(err.to_string())
    }
}
