//! Interval aggregation.
//!
//! Per-frame counts are folded into one sample per window using the maximum
//! count seen, not the mean: a brief crowd should not be averaged away when
//! the figure is used for capacity and attendance.

pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// One window reduced to a single sample.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WindowSummary {
    pub people_count: u32,
    pub frames_processed: u32,
    pub avg_inference_ms: f64,
}

#[derive(Clone, Debug)]
pub struct IntervalAggregator {
    window_secs: u64,
    counts: Vec<u32>,
    latencies: Vec<f64>,
}

impl IntervalAggregator {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            counts: Vec::new(),
            latencies: Vec::new(),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn add(&mut self, people_count: u32, inference_ms: f64) {
        self.counts.push(people_count);
        self.latencies.push(inference_ms);
    }

    /// Frames accumulated in the open window.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// True once `frame_count` reaches `window_secs * fps` (inclusive).
    pub fn should_flush(&self, frame_count: usize, fps: u32) -> bool {
        let threshold = self.window_secs.saturating_mul(fps as u64);
        frame_count as u64 >= threshold
    }

    /// Reduce the open window and start a new one.
    pub fn flush(&mut self) -> WindowSummary {
        let counts = std::mem::take(&mut self.counts);
        let latencies = std::mem::take(&mut self.latencies);

        let avg_inference_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        WindowSummary {
            people_count: counts.iter().copied().max().unwrap_or(0),
            frames_processed: u32::try_from(counts.len()).unwrap_or(u32::MAX),
            avg_inference_ms,
        }
    }

    /// Drop the open window without producing a sample.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.latencies.clear();
    }
}

impl Default for IntervalAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }
}
