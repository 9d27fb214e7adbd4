use anyhow::Result;

use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// Object-detection model behind the person detector.
///
/// A backend is loaded once per processing session and owned by that
/// session's thread, so `detect` takes `&mut self` and implementations need
/// not be `Sync`.
///
/// The confidence threshold is fixed when the backend is loaded; `detect`
/// must only return detections at or above it. Class filtering is left to
/// the caller.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
