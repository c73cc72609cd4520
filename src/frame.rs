//! Captured frames.
//!
//! A `Frame` is immutable once built. Workers share it through
//! [`crate::cell::SnapshotCell`] as an `Arc<Frame>`, and the dispatcher uses
//! `Arc` pointer identity to decide whether it has already processed a frame.

use std::io::Cursor;
use std::time::Instant;

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

use crate::error::RecognitionError;

/// Raw RGB8 frame.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-source counter, starting at 1.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {}x{} expects {} bytes of RGB8, got {}",
                width,
                height,
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Left-right mirror image, as a selfie preview shows it.
    pub fn mirrored(&self) -> Self {
        let row_len = self.width as usize * 3;
        let mut pixels = Vec::with_capacity(self.pixels.len());
        for row in self.pixels.chunks_exact(row_len) {
            for px in row.chunks_exact(3).rev() {
                pixels.extend_from_slice(px);
            }
        }
        Self {
            pixels,
            width: self.width,
            height: self.height,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    /// Encode as a baseline JPEG for submission to the recognition service.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, RecognitionError> {
        encode_rgb_jpeg(&self.pixels, self.width, self.height, quality)
    }
}

pub(crate) fn encode_rgb_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, RecognitionError> {
    let mut out = Cursor::new(Vec::with_capacity(pixels.len() / 8));
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| RecognitionError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 7]);
            }
        }
        Frame::new(pixels, width, height, 1).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0; 10], 2, 2, 1).is_err());
        assert!(Frame::new(Vec::new(), 0, 0, 1).is_err());
    }

    #[test]
    fn mirror_reverses_each_row() {
        let frame = gradient(3, 2);
        let mirrored = frame.mirrored();
        assert_eq!(&mirrored.pixels()[0..3], &[2, 0, 7]);
        assert_eq!(&mirrored.pixels()[6..9], &[0, 0, 7]);
        assert_eq!(&mirrored.pixels()[9..12], &[2, 1, 7]);
        assert_eq!(mirrored.sequence, frame.sequence);
    }

    #[test]
    fn encodes_decodable_jpeg() {
        let frame = gradient(16, 8);
        let jpeg = frame.encode_jpeg(85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
    }
}
