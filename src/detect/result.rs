/// COCO class id for "person".
pub const PERSON_CLASS_ID: usize = 0;

/// Result of running a backend on one frame.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    /// Detections that cleared the backend's confidence threshold, any class.
    pub detections: Vec<Detection>,
    /// Pure inference latency as measured by the backend, excluding pre/post
    /// processing. `None` when the backend does not measure it.
    pub inference_ms: Option<f64>,
}

/// One detected instance. Box coordinates are in pixels of the frame that
/// was passed to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Greedy non-max suppression, highest confidence first.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let overlaps = (0..kept).any(|prev| {
            detections[prev].class_id == detections[index].class_id
                && detections[prev].iou(&detections[index]) > iou_threshold
        });
        if !overlaps {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, confidence: f32, class_id: usize) -> Detection {
        Detection {
            x,
            y,
            w: 10.0,
            h: 10.0,
            confidence,
            class_id,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = boxed(0.0, 0.0, 0.9, 0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&boxed(50.0, 50.0, 0.9, 0)), 0.0);
    }

    #[test]
    fn nms_drops_overlapping_lower_confidence() {
        let mut detections = vec![
            boxed(0.0, 0.0, 0.6, 0),
            boxed(1.0, 1.0, 0.9, 0),
            boxed(40.0, 40.0, 0.5, 0),
        ];
        non_max_suppression(&mut detections, 0.45);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[1].confidence, 0.5);
    }

    #[test]
    fn nms_keeps_overlapping_boxes_of_different_classes() {
        let mut detections = vec![boxed(0.0, 0.0, 0.8, 0), boxed(0.0, 0.0, 0.7, 2)];
        non_max_suppression(&mut detections, 0.45);
        assert_eq!(detections.len(), 2);
    }
}
