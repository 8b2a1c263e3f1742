//! V4L2 webcam backend with memory-mapped streaming

use std::io;
use std::time::Duration;

use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decoder::{decode_frame, WireFormat};
use crate::capture::device::{resolve_source, CaptureBackend, DeviceHandle, RawImage};
use crate::error::DeviceError;
use crate::Resolution;

/// Opens `/dev/video*` nodes, preferring MJPEG and falling back to YUYV.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
        }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new(4)
    }
}

pub struct V4l2Handle {
    // Stream first so it unmaps before the device closes
    stream: MmapStream<'static>,
    _device: Device,
    wire: WireFormat,
    width: u32,
    height: u32,
    timeout: Option<Duration>,
    fps: Option<f64>,
}

impl CaptureBackend for V4l2Backend {
    type Handle = V4l2Handle;

    #[instrument(skip(self))]
    fn open(&self, source_id: &str, requested: Resolution) -> Result<V4l2Handle, DeviceError> {
        let path = resolve_source(source_id);
        let open_err = |reason: String| DeviceError::Open {
            source_id: path.clone(),
            reason,
        };

        let device = Device::with_path(&path).map_err(|e| open_err(e.to_string()))?;

        let caps = device.query_caps().map_err(|e| open_err(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_err("device doesn't support video capture".into()));
        }

        let mut fmt = device.format().map_err(|e| open_err(e.to_string()))?;
        fmt.width = requested.width;
        fmt.height = requested.height;
        fmt.fourcc = FourCC::new(b"MJPG");
        let mut fmt = device.set_format(&fmt).map_err(|e| open_err(e.to_string()))?;
        if fmt.fourcc != FourCC::new(b"MJPG") {
            fmt.fourcc = FourCC::new(b"YUYV");
            fmt = device.set_format(&fmt).map_err(|e| open_err(e.to_string()))?;
        }

        let wire = if fmt.fourcc == FourCC::new(b"MJPG") {
            WireFormat::Mjpeg
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            WireFormat::Yuyv
        } else if fmt.fourcc == FourCC::new(b"RGB3") {
            WireFormat::Rgb24
        } else {
            return Err(DeviceError::UnsupportedFormat(fmt.fourcc.to_string()));
        };

        let fps = device.params().ok().and_then(|params| {
            let interval = params.interval;
            (interval.numerator > 0)
                .then(|| interval.denominator as f64 / interval.numerator as f64)
        });

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| open_err(e.to_string()))?;

        info!(
            "Streaming {}x{} {:?} with {} buffers",
            fmt.width, fmt.height, wire, self.buffer_count
        );

        Ok(V4l2Handle {
            stream,
            _device: device,
            wire,
            width: fmt.width,
            height: fmt.height,
            timeout: None,
            fps,
        })
    }
}

impl DeviceHandle for V4l2Handle {
    fn read(&mut self, timeout: Duration) -> Result<RawImage, DeviceError> {
        if self.timeout != Some(timeout) {
            self.stream.set_timeout(timeout);
            self.timeout = Some(timeout);
        }

        let (buf, _meta) = self.stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => DeviceError::Timeout(timeout),
            io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => DeviceError::Disconnected,
            _ => DeviceError::Read(e.to_string()),
        })?;

        decode_frame(buf, self.wire, self.width, self.height)
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.fps
    }
}
