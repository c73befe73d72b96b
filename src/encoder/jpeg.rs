//! JPEG compression of raw frames

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::frame::{Frame, PixelFormat};

/// Lowest accepted quality
pub const MIN_QUALITY: u8 = 1;
/// Highest accepted quality
pub const MAX_QUALITY: u8 = 100;

/// Error type for frame encoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// Width or height is zero
    #[error("frame has zero width or height")]
    EmptyFrame,
    /// Pixel buffer does not match the declared dimensions
    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },
    /// The codec rejected the image
    #[error("jpeg codec: {0}")]
    Codec(String),
}

/// Clamp a quality setting into the codec's range
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_QUALITY, MAX_QUALITY)
}

/// Encode a raw frame as JPEG at the given quality
pub fn encode(frame: &Frame, quality: u8) -> Result<Bytes, EncodeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(EncodeError::EmptyFrame);
    }

    let expected = frame.expected_len();
    if frame.pixels.len() != expected {
        return Err(EncodeError::BufferSizeMismatch {
            expected,
            actual: frame.pixels.len(),
        });
    }

    // JPEG has no alpha channel
    let stripped;
    let (pixels, color) = match frame.format {
        PixelFormat::Rgba8 => {
            stripped = frame
                .pixels
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect::<Vec<u8>>();
            (&stripped[..], ExtendedColorType::Rgb8)
        }
        PixelFormat::Rgb8 => (&frame.pixels[..], ExtendedColorType::Rgb8),
        PixelFormat::Luma8 => (&frame.pixels[..], ExtendedColorType::L8),
    };

    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, clamp_quality(quality))
        .encode(pixels, frame.width, frame.height, color)
        .map_err(|e| EncodeError::Codec(e.to_string()))?;

    Ok(Bytes::from(out))
}

/// Image sent to blocked addresses when none is configured
pub fn default_blocked_image() -> Result<Bytes, EncodeError> {
    encode(&Frame::solid_rgb(320, 240, [48, 48, 48]), MAX_QUALITY)
}
