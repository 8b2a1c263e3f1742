//! Conversion of native webcam encodings into packed RGB

use image::ImageFormat;

use crate::capture::device::RawImage;
use crate::capture::frame::PixelFormat;
use crate::error::DeviceError;

/// Wire encodings a webcam may hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Mjpeg,
    Yuyv,
    Rgb24,
}

pub fn decode_frame(
    data: &[u8],
    format: WireFormat,
    width: u32,
    height: u32,
) -> Result<RawImage, DeviceError> {
    match format {
        WireFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                .map_err(|e| DeviceError::Decode(e.to_string()))?
                .into_rgb8();
            let (width, height) = decoded.dimensions();
            Ok(RawImage {
                data: decoded.into_raw(),
                width,
                height,
                format: PixelFormat::Rgb24,
            })
        }
        WireFormat::Yuyv => Ok(RawImage {
            data: yuyv_to_rgb(data, width, height)?,
            width,
            height,
            format: PixelFormat::Rgb24,
        }),
        WireFormat::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            if data.len() < expected {
                return Err(DeviceError::Decode(format!(
                    "short RGB buffer: {} < {expected}",
                    data.len()
                )));
            }
            Ok(RawImage {
                data: data[..expected].to_vec(),
                width,
                height,
                format: PixelFormat::Rgb24,
            })
        }
    }
}

/// YUYV 4:2:2 (BT.601, limited range) to packed RGB.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DeviceError> {
    let pixels = width as usize * height as usize;
    if width % 2 != 0 {
        return Err(DeviceError::UnsupportedFormat(format!(
            "YUYV needs an even width, got {width}"
        )));
    }
    if data.len() < pixels * 2 {
        return Err(DeviceError::Decode(format!(
            "short YUYV buffer: {} < {}",
            data.len(),
            pixels * 2
        )));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{codecs::jpeg::JpegEncoder, ImageEncoder, RgbImage};

    #[test]
    fn test_yuyv_black_and_white() {
        // Two pixels of black, two of white
        let data = [16, 128, 16, 128, 235, 128, 235, 128];
        let rgb = yuyv_to_rgb(&data, 4, 1).unwrap();
        assert_eq!(&rgb[..6], &[0, 0, 0, 0, 0, 0]);
        assert_eq!(&rgb[6..], &[255, 255, 255, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_rejects_odd_width() {
        let err = yuyv_to_rgb(&[0; 6], 3, 1).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_yuyv_rejects_short_buffer() {
        let err = yuyv_to_rgb(&[0; 4], 4, 1).unwrap_err();
        assert!(matches!(err, DeviceError::Decode(_)));
    }

    #[test]
    fn test_mjpeg_decode() {
        let img = RgbImage::from_fn(16, 8, |x, y| image::Rgb([(x * 8) as u8, (y * 16) as u8, 80]));
        let mut jpeg = Vec::new();
        JpegEncoder::new(&mut jpeg)
            .write_image(img.as_raw(), 16, 8, image::ExtendedColorType::Rgb8)
            .unwrap();

        let raw = decode_frame(&jpeg, WireFormat::Mjpeg, 0, 0).unwrap();
        assert_eq!((raw.width, raw.height), (16, 8));
        assert_eq!(raw.data.len(), 16 * 8 * 3);
        assert_eq!(raw.format, PixelFormat::Rgb24);
    }

    #[test]
    fn test_mjpeg_garbage_is_decode_error() {
        let err = decode_frame(&[0xde, 0xad], WireFormat::Mjpeg, 2, 2).unwrap_err();
        assert!(matches!(err, DeviceError::Decode(_)));
    }

    #[test]
    fn test_rgb_passthrough_trims_padding() {
        let raw = decode_frame(&[1, 2, 3, 4, 5, 6, 0, 0], WireFormat::Rgb24, 2, 1).unwrap();
        assert_eq!(raw.data, vec![1, 2, 3, 4, 5, 6]);
    }
}
