//! Boundary to the hardware capture primitive
//!
//! A backend opens a device and hands back an exclusively owned handle. The
//! handle is the only thing that touches the hardware; dropping it releases
//! the device, so every exit path of the capture loop closes it.

use std::time::Duration;

use crate::capture::frame::PixelFormat;
use crate::error::DeviceError;
use crate::Resolution;

/// One decoded image as delivered by a device, before it becomes a [`Frame`].
///
/// [`Frame`]: crate::capture::Frame
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Opens capture devices. Shared between restarts of the capture worker.
pub trait CaptureBackend: Send + Sync + 'static {
    type Handle: DeviceHandle + 'static;

    /// Open `source_id`, asking for `requested` as the native resolution.
    ///
    /// The device may settle on a different size; frames report what was
    /// actually delivered.
    fn open(&self, source_id: &str, requested: Resolution) -> Result<Self::Handle, DeviceError>;
}

/// An open device. Dropping it closes the device.
pub trait DeviceHandle: Send {
    /// Read one frame, giving up after roughly `timeout`.
    fn read(&mut self, timeout: Duration) -> Result<RawImage, DeviceError>;

    /// Frame rate the device negotiated, if it reports one.
    fn nominal_fps(&self) -> Option<f64> {
        None
    }
}

/// Map the webcam-index shorthand used on the command line to a device path.
///
/// `"0"` becomes `/dev/video0`; anything that is not a bare index is kept as-is.
pub fn resolve_source(source_id: &str) -> String {
    match source_id.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{index}"),
        Err(_) => source_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_source_index() {
        assert_eq!(resolve_source("0"), "/dev/video0");
        assert_eq!(resolve_source(" 3 "), "/dev/video3");
    }

    #[test]
    fn test_resolve_source_path_passthrough() {
        assert_eq!(resolve_source("/dev/video2"), "/dev/video2");
        assert_eq!(resolve_source("pattern"), "pattern");
    }
}
