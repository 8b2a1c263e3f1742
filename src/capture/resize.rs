//! Read-time resampling for inference consumers

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb};

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::FrameError;
use crate::Resolution;

/// Bilinear filter: deterministic and cheap enough to run on every poll.
const FILTER: FilterType = FilterType::Triangle;

/// Resample `frame` to exactly `target`, keeping its timestamp and sequence id.
///
/// A frame already at the target size is returned as a cheap clone.
pub fn resize_frame(frame: &Frame, target: Resolution) -> Result<Frame, FrameError> {
    if frame.width == target.width && frame.height == target.height {
        return Ok(frame.clone());
    }

    let data = match frame.format {
        PixelFormat::Rgb24 => resample::<Rgb<u8>>(frame, target)?,
        PixelFormat::Gray8 => resample::<Luma<u8>>(frame, target)?,
    };

    Frame::new(
        data,
        target.width,
        target.height,
        frame.format,
        frame.timestamp,
        frame.sequence,
    )
}

fn resample<P>(frame: &Frame, target: Resolution) -> Result<Vec<u8>, FrameError>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let expected = frame.width as usize * frame.height as usize * P::CHANNEL_COUNT as usize;
    let src = ImageBuffer::<P, &[u8]>::from_raw(frame.width, frame.height, &frame.data[..])
        .ok_or(FrameError::SizeMismatch {
            format: frame.format,
            width: frame.width,
            height: frame.height,
            expected,
            actual: frame.data.len(),
        })?;

    Ok(imageops::resize(&src, target.width, target.height, FILTER).into_raw())
}
