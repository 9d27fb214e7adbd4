use std::time::Instant;

use crate::detect::backend::DetectorBackend;
use crate::frame::Frame;

/// Person detections for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectorOutput {
    /// `(class_id, confidence)` for every person instance.
    pub detections: Vec<(usize, f32)>,
    pub inference_ms: f64,
}

impl DetectorOutput {
    pub fn people(&self) -> usize {
        self.detections.len()
    }
}

/// Wraps a detection backend and narrows its output to people.
///
/// Inference failures are absorbed here: a backend error or a malformed
/// frame yields an empty output with zero latency, so a bad frame reads as
/// "nobody observed" and never ends the session.
pub struct PersonDetector {
    backend: Box<dyn DetectorBackend>,
}

impl PersonDetector {
    pub fn new(backend: Box<dyn DetectorBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn detect(&mut self, frame: &Frame) -> DetectorOutput {
        if !frame.is_well_formed() {
            log::debug!(
                "skipping malformed {}x{} frame ({} bytes)",
                frame.width(),
                frame.height(),
                frame.pixels().len()
            );
            return DetectorOutput::default();
        }

        let started = Instant::now();
        match self.backend.detect(frame) {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let detections = result
                    .detections
                    .iter()
                    .filter(|d| d.is_person())
                    .map(|d| (d.class_id, d.confidence))
                    .collect();
                DetectorOutput {
                    detections,
                    inference_ms: result.inference_ms.unwrap_or(elapsed_ms).max(0.0),
                }
            }
            Err(e) => {
                log::warn!("inference failed on {} backend: {:#}", self.backend.name(), e);
                DetectorOutput::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::{Detection, DetectionResult, PERSON_CLASS_ID};
    use anyhow::{anyhow, Result};

    struct MixedBackend;

    impl DetectorBackend for MixedBackend {
        fn name(&self) -> &'static str {
            "mixed"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult> {
            let det = |class_id, confidence| Detection {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
                confidence,
                class_id,
            };
            Ok(DetectionResult {
                detections: vec![det(0, 0.91), det(2, 0.8), det(0, 0.47), det(16, 0.6)],
                inference_ms: Some(12.5),
            })
        }
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult> {
            Err(anyhow!("cuda out of memory"))
        }
    }

    #[test]
    fn keeps_only_people() {
        let mut detector = PersonDetector::new(Box::new(MixedBackend));
        let output = detector.detect(&Frame::filled(4, 4, [0, 0, 0]));
        assert_eq!(output.people(), 2);
        assert!(output.detections.iter().all(|(c, _)| *c == PERSON_CLASS_ID));
        assert_eq!(output.inference_ms, 12.5);
    }

    #[test]
    fn backend_error_degrades_to_empty() {
        let mut detector = PersonDetector::new(Box::new(FailingBackend));
        let output = detector.detect(&Frame::filled(4, 4, [0, 0, 0]));
        assert_eq!(output, DetectorOutput::default());
    }

    #[test]
    fn malformed_frame_never_reaches_backend() {
        let mut detector = PersonDetector::new(Box::new(MixedBackend));
        let output = detector.detect(&Frame::from_rgb(vec![1, 2], 640, 480));
        assert_eq!(output.people(), 0);
        assert_eq!(output.inference_ms, 0.0);
    }
}
