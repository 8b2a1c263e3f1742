//! Webcam frame-acquisition core
//!
//! A dedicated capture worker owns the device, pushes frames into a small
//! bounded buffer and absorbs hardware failures with a backoff state
//! machine. Consumers poll [`WebcamCapture`] for the freshest frame at
//! capture or inference resolution and never block on the device.

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod webcam;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureBackend, CaptureState, DeviceHandle, Frame, PixelFormat, RawImage};
pub use error::{CaptureError, ConfigError, DeviceError, FrameError};
pub use pipeline::{BoundedFrameBuffer, BufferStats, FpsTracker};
pub use webcam::{CaptureStats, WebcamCapture};

/// Environment variables prefixed with this override file settings,
/// e.g. `AQUARIUM__TARGET_FPS=15` or `AQUARIUM__CAPTURE_RESOLUTION__WIDTH=1920`.
pub const ENV_PREFIX: &str = "AQUARIUM";

/// Slowest accepted `target_fps`: one frame every 1000 seconds
pub const MIN_TARGET_FPS: f64 = 0.001;
pub const MAX_BUFFER_CAPACITY: usize = 1024;
pub const MAX_FPS_WINDOW: usize = 10_000;

/// Image size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Resolution = Resolution::new(640, 480);
    pub const HD: Resolution = Resolution::new(1280, 720);
    pub const INFERENCE: Resolution = Resolution::new(640, 360);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_positive(self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Capture configuration, validated by [`WebcamCapture::start`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device path, or a bare webcam index such as `"0"`
    pub source: String,
    /// Native size requested from the device
    pub capture_resolution: Resolution,
    /// Size served by `get_inference_frame`
    pub inference_resolution: Resolution,
    /// Throttle; `None` takes whatever rate the device delivers
    pub target_fps: Option<f64>,
    pub buffer_capacity: usize,
    /// Samples in the rolling FPS window
    pub fps_window: usize,
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    /// Upper bound on a single device read
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    /// How long `stop` waits for the worker to release the device
    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,
    /// Pin the capture worker to this CPU core
    pub capture_core: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "0".into(),
            capture_resolution: Resolution::HD,
            inference_resolution: Resolution::INFERENCE,
            target_fps: None,
            buffer_capacity: 3,
            fps_window: 30,
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            read_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(2),
            capture_core: None,
        }
    }
}

impl CaptureConfig {
    /// Load from a TOML file, then apply `AQUARIUM__*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Defaults plus `AQUARIUM__*` environment overrides.
    pub fn from_env() -> Result<Self, CaptureError> {
        let settings = config::Config::builder()
            .add_source(Self::environment())
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, CaptureError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::EmptySource);
        }
        for (field, res) in [
            ("capture_resolution", self.capture_resolution),
            ("inference_resolution", self.inference_resolution),
        ] {
            if !res.is_positive() {
                return Err(ConfigError::InvalidResolution {
                    field,
                    width: res.width,
                    height: res.height,
                });
            }
        }
        if let Some(fps) = self.target_fps {
            if !(fps.is_finite() && fps >= MIN_TARGET_FPS) {
                return Err(ConfigError::InvalidFps(fps));
            }
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(ConfigError::CapacityTooLarge(self.buffer_capacity));
        }
        if self.fps_window < 2 {
            return Err(ConfigError::FpsWindowTooSmall(self.fps_window));
        }
        if self.fps_window > MAX_FPS_WINDOW {
            return Err(ConfigError::FpsWindowTooLarge(self.fps_window));
        }
        for (field, value) in [
            ("reconnect_base_delay", self.reconnect_base_delay),
            ("reconnect_max_delay", self.reconnect_max_delay),
            ("read_timeout", self.read_timeout),
            ("stop_timeout", self.stop_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(ConfigError::BackoffRange {
                base: self.reconnect_base_delay,
                max: self.reconnect_max_delay,
            });
        }
        if self.read_timeout >= self.stop_timeout {
            return Err(ConfigError::ReadTimeoutTooLong {
                read: self.read_timeout,
                stop: self.stop_timeout,
            });
        }
        Ok(())
    }

    /// Spacing between kept frames when `target_fps` is set
    pub fn frame_interval(&self) -> Option<Duration> {
        self.target_fps
            .and_then(|fps| Duration::try_from_secs_f64(fps.recip()).ok())
    }

    /// Inference frames larger than the native frames in either dimension
    pub fn upscales_for_inference(&self) -> bool {
        self.inference_resolution.width > self.capture_resolution.width
            || self.inference_resolution.height > self.capture_resolution.height
    }
}

/// Durations are written as whole milliseconds in config files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CaptureConfig::default();
        assert_eq!(config.inference_resolution, Resolution::new(640, 360));
        assert_eq!(config.buffer_capacity, 3);
        assert!(config.validate().is_ok());
        assert!(!config.upscales_for_inference());
    }

    #[test]
    fn test_rejects_zero_resolution() {
        let config = CaptureConfig {
            inference_resolution: Resolution::new(0, 360),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidResolution {
                field: "inference_resolution",
                width: 0,
                height: 360,
            })
        );
    }

    #[test]
    fn test_rejects_bad_fps() {
        for fps in [0.0, -5.0, 1e-20, 0.0009, f64::NAN, f64::INFINITY] {
            let config = CaptureConfig {
                target_fps: Some(fps),
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::InvalidFps(_))));
        }
    }

    #[test]
    fn test_slowest_rate_has_an_interval() {
        let config = CaptureConfig {
            target_fps: Some(MIN_TARGET_FPS),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_interval(), Some(Duration::from_secs(1000)));

        let unthrottled = CaptureConfig::default();
        assert_eq!(unthrottled.frame_interval(), None);
    }

    #[test]
    fn test_rejects_oversized_buffers() {
        let config = CaptureConfig {
            buffer_capacity: usize::MAX,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CapacityTooLarge(usize::MAX)));

        let config = CaptureConfig {
            fps_window: usize::MAX,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::FpsWindowTooLarge(usize::MAX)));

        let config = CaptureConfig {
            buffer_capacity: MAX_BUFFER_CAPACITY,
            fps_window: MAX_FPS_WINDOW,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = CaptureConfig {
            buffer_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config = CaptureConfig {
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BackoffRange { .. })));
    }

    #[test]
    fn test_rejects_read_timeout_past_stop_timeout() {
        let config = CaptureConfig {
            read_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReadTimeoutTooLong { .. })
        ));
    }

    #[test]
    fn test_upscale_detection() {
        let config = CaptureConfig {
            capture_resolution: Resolution::new(320, 240),
            ..Default::default()
        };
        assert!(config.upscales_for_inference());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides_defaults() {
        let config = CaptureConfig::from_toml_str(
            r#"
            source = "/dev/video2"
            target_fps = 15.0
            buffer_capacity = 5
            reconnect_max_delay = 2500

            [capture_resolution]
            width = 1920
            height = 1080
            "#,
        )
        .unwrap();

        assert_eq!(config.source, "/dev/video2");
        assert_eq!(config.target_fps, Some(15.0));
        assert_eq!(config.buffer_capacity, 5);
        assert_eq!(config.reconnect_max_delay, Duration::from_millis(2500));
        assert_eq!(config.capture_resolution, Resolution::new(1920, 1080));
        assert_eq!(config.inference_resolution, Resolution::INFERENCE);
        assert_eq!(config.read_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::HD.to_string(), "1280x720");
    }
}
