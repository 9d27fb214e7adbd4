//! Per-frame pipeline: resize policy, person detection, count and latency.

use anyhow::Result;
use image::imageops::FilterType;
use std::borrow::Cow;

use crate::detect::PersonDetector;
use crate::frame::Frame;

/// Frames taller than this are downscaled before inference.
pub const MAX_FRAME_HEIGHT: u32 = 1080;

/// What one frame contributed to the open window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameObservation {
    pub people_count: u32,
    pub inference_ms: f64,
}

pub struct FrameProcessor {
    detector: PersonDetector,
    max_height: u32,
}

impl FrameProcessor {
    pub fn new(detector: PersonDetector) -> Self {
        Self::with_max_height(detector, MAX_FRAME_HEIGHT)
    }

    pub fn with_max_height(detector: PersonDetector, max_height: u32) -> Self {
        Self {
            detector,
            max_height: max_height.max(1),
        }
    }

    pub fn max_height(&self) -> u32 {
        self.max_height
    }

    /// Count people in a frame. Never fails; anything that goes wrong reads
    /// as an empty frame with zero latency.
    pub fn process(&mut self, frame: &Frame) -> FrameObservation {
        if !frame.is_well_formed() {
            log::debug!(
                "dropping malformed frame {}x{} ({} bytes)",
                frame.width(),
                frame.height(),
                frame.pixels().len()
            );
            return FrameObservation::default();
        }

        let prepared = match fit_to_height(frame, self.max_height) {
            Ok(prepared) => prepared,
            Err(e) => {
                log::warn!("failed to resize frame: {:#}", e);
                return FrameObservation::default();
            }
        };

        let output = self.detector.detect(&prepared);
        FrameObservation {
            people_count: u32::try_from(output.people()).unwrap_or(u32::MAX),
            inference_ms: output.inference_ms,
        }
    }
}

/// Aspect-preserving downscale to `max_height` for frames taller than it.
/// Shorter frames are borrowed unchanged.
pub fn fit_to_height(frame: &Frame, max_height: u32) -> Result<Cow<'_, Frame>> {
    if frame.height() <= max_height {
        return Ok(Cow::Borrowed(frame));
    }
    let scale = max_height as f64 / frame.height() as f64;
    let width = ((frame.width() as f64 * scale).round() as u32).max(1);
    let image = frame.to_image()?;
    let resized = image::imageops::resize(&image, width, max_height, FilterType::Triangle);
    Ok(Cow::Owned(Frame::from_image(resized)))
}
