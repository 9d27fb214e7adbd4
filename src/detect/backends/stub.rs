use anyhow::{anyhow, Result};
use url::Url;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult, PERSON_CLASS_ID};
use crate::frame::Frame;

const STUB_CONFIDENCE: f32 = 0.9;
/// COCO "car", emitted alongside people so class filtering is exercised.
const STUB_OTHER_CLASS_ID: usize = 2;

/// Scripted backend for tests and demo runs.
///
/// Each call emits the next person count from a cyclic script, plus a fixed
/// number of non-person objects. Model paths look like
/// `stub://?people=2,3,5&others=1`; a bare `stub://` sees nobody.
pub struct StubBackend {
    script: Vec<u32>,
    others: u32,
    cursor: usize,
    confidence: f32,
    threshold: f32,
}

impl StubBackend {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            others: 0,
            cursor: 0,
            confidence: STUB_CONFIDENCE,
            threshold: 0.0,
        }
    }

    pub fn from_model_path(model_path: &str) -> Result<Self> {
        let url = Url::parse(model_path)
            .map_err(|e| anyhow!("invalid stub model path '{}': {}", model_path, e))?;
        let mut backend = Self::new(Vec::new());
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "people" => {
                    backend.script = value
                        .split(',')
                        .map(|entry| entry.trim())
                        .filter(|entry| !entry.is_empty())
                        .map(|entry| {
                            entry
                                .parse::<u32>()
                                .map_err(|_| anyhow!("invalid people count '{}'", entry))
                        })
                        .collect::<Result<Vec<_>>>()?;
                }
                "others" => {
                    backend.others = value
                        .parse()
                        .map_err(|_| anyhow!("invalid others count '{}'", value))?;
                }
                "confidence" => {
                    backend.confidence = value
                        .parse()
                        .map_err(|_| anyhow!("invalid confidence '{}'", value))?;
                }
                other => return Err(anyhow!("unknown stub model option '{}'", other)),
            }
        }
        Ok(backend)
    }

    pub fn with_others(mut self, others: u32) -> Self {
        self.others = others;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    fn next_people(&mut self) -> u32 {
        if self.script.is_empty() {
            return 0;
        }
        let people = self.script[self.cursor % self.script.len()];
        self.cursor = self.cursor.wrapping_add(1);
        people
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let people = self.next_people();
        if self.confidence < self.threshold {
            return Ok(DetectionResult::default());
        }

        let slot_w = frame.width() as f32 / (people + self.others).max(1) as f32;
        let h = frame.height() as f32;
        let detections = (0..people)
            .map(|_| PERSON_CLASS_ID)
            .chain((0..self.others).map(|_| STUB_OTHER_CLASS_ID))
            .enumerate()
            .map(|(i, class_id)| Detection {
                x: i as f32 * slot_w,
                y: 0.0,
                w: slot_w,
                h,
                confidence: self.confidence,
                class_id,
            })
            .collect();

        Ok(DetectionResult {
            detections,
            inference_ms: None,
        })
    }
}
