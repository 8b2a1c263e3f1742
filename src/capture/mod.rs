pub mod decoder;
pub mod device;
pub mod frame;
pub mod pattern;
pub mod reconnect;
pub mod resize;
pub mod worker;

#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use device::{CaptureBackend, DeviceHandle, RawImage};
pub use frame::{Frame, PixelFormat};
pub use pattern::TestPattern;
pub use reconnect::{CaptureState, ReconnectPolicy};
pub use resize::resize_frame;

#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;
