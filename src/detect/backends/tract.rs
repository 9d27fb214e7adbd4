#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, Detection, DetectionResult};
use crate::frame::Frame;

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
/// Grey used by YOLOv8 letterboxing.
const LETTERBOX_FILL: f32 = 114.0 / 255.0;
/// cx, cy, w, h precede the class scores in each prediction column.
const BOX_FIELDS: usize = 4;

/// YOLOv8 detection model run through tract.
///
/// Expects the standard ultralytics export: input `[1, 3, S, S]` RGB in 0..1,
/// output `[1, 4 + classes, anchors]`. Frames are letterboxed into the input
/// square and boxes are mapped back to frame pixels.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::with_input_size(model_path, DEFAULT_INPUT_SIZE)
    }

    pub fn with_input_size<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    /// Letterbox the frame into the model input. Returns the tensor and the
    /// scale factor applied to the frame.
    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32)> {
        let image = frame.to_image()?;
        let size = self.input_size;
        let ratio =
            (size as f32 / frame.width() as f32).min(size as f32 / frame.height() as f32);
        let scaled_w = ((frame.width() as f32 * ratio).round() as u32).clamp(1, size);
        let scaled_h = ((frame.height() as f32 * ratio).round() as u32).clamp(1, size);
        let resized = image::imageops::resize(&image, scaled_w, scaled_h, FilterType::Triangle);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            if x < scaled_w as usize && y < scaled_h as usize {
                resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
            } else {
                LETTERBOX_FILL
            }
        });

        Ok((input.into_tensor(), ratio))
    }

    fn decode(&self, outputs: TVec<TValue>, ratio: f32, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_FIELDS {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let frame_w = frame.width() as f32;
        let frame_h = frame.height() as f32;

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let (class_id, confidence) = (BOX_FIELDS..rows)
                .map(|row| (row - BOX_FIELDS, preds[[0, row, anchor]]))
                .fold((0usize, f32::NEG_INFINITY), |best, candidate| {
                    if candidate.1 > best.1 {
                        candidate
                    } else {
                        best
                    }
                });
            if !confidence.is_finite() || confidence < self.confidence_threshold {
                continue;
            }

            let cx = preds[[0, 0, anchor]] / ratio;
            let cy = preds[[0, 1, anchor]] / ratio;
            let w = preds[[0, 2, anchor]] / ratio;
            let h = preds[[0, 3, anchor]] / ratio;
            detections.push(Detection {
                x: (cx - w / 2.0).clamp(0.0, frame_w),
                y: (cy - h / 2.0).clamp(0.0, frame_h),
                w,
                h,
                confidence,
                class_id,
            });
        }

        non_max_suppression(&mut detections, self.iou_threshold);
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let (input, ratio) = self.build_input(frame)?;
        let started = Instant::now();
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;
        let detections = self.decode(outputs, ratio, frame)?;

        Ok(DetectionResult {
            detections,
            inference_ms: Some(inference_ms),
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(self.input_size, self.input_size, [114, 114, 114]);
        self.detect(&blank).map(|_| ())
    }
}
