//! Decoded video frames.
//!
//! Sources hand out `Frame`s holding packed RGB24 pixels. A frame is not
//! validated on construction: decoders and test fixtures may produce buffers
//! that do not match their declared dimensions, and the processing pipeline
//! treats such frames as "nothing observed" instead of failing.

use anyhow::{anyhow, Result};
use image::RgbImage;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
        }
    }

    /// Solid-colour frame, mostly for synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixel_count = (width as usize).saturating_mul(height as usize);
        let mut pixels = Vec::with_capacity(pixel_count.saturating_mul(3));
        for _ in 0..pixel_count {
            pixels.extend_from_slice(&rgb);
        }
        Self::from_rgb(pixels, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Expected byte length for the declared dimensions, if it fits in memory.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(3))
    }

    /// Non-empty dimensions and a buffer that matches them exactly.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.expected_len() == Some(self.pixels.len())
    }

    pub fn to_image(&self) -> Result<RgbImage> {
        if !self.is_well_formed() {
            return Err(anyhow!(
                "frame buffer of {} bytes does not match {}x{} RGB",
                self.pixels.len(),
                self.width,
                self.height
            ));
        }
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer rejected by image decoder"))
    }
}
