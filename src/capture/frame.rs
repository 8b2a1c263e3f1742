use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// One captured image plus its capture metadata.
///
/// Pixel memory is shared, not copied, when a frame is cloned or handed to
/// several consumers. Consumers that need to mutate pixels take a copy with
/// [`Frame::to_owned_pixels`].
#[derive(Clone)]
pub struct Frame {
    /// Immutable, tightly packed pixel rows
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Monotonic capture time
    pub timestamp: Instant,

    /// Strictly increasing per capture facade, starting at 1
    pub sequence: u64,
}

/// Pixel layouts a [`Frame`] can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

impl Frame {
    /// Build a frame, checking that `data` covers exactly `width * height` pixels.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Instant,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }

        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                format,
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            width,
            height,
            format,
            timestamp,
            sequence,
        })
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Private copy of the pixels for consumers that draw on or otherwise mutate them.
    pub fn to_owned_pixels(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
