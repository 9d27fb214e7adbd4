#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use occupancy_engine::{
    BackendRegistry, CancelToken, CaptureTarget, Detection, DetectionResult, DetectorBackend,
    Frame, InMemoryOccupancyStore, NewSample, OccupancySample, OccupancyStore, ReconnectPolicy,
    SessionConfig, SessionDeps, SourceFactory, StreamSource, TargetKind, TargetRecord, TargetRef,
    TargetStatus,
};

/// Pixel value that makes `PixelCountBackend` fail inference.
pub const FAIL_INFERENCE: u8 = 255;

pub const TEST_MODEL: &str = "test://pixel-count";
pub const BROKEN_MODEL: &str = "broken://missing";

#[derive(Clone, Copy, Debug)]
pub enum Step {
    /// A frame whose first pixel carries the person count.
    People(u8),
    Fail,
}

#[derive(Default)]
pub struct Script {
    pub steps: VecDeque<Step>,
    /// Repeated once `steps` runs out. None: cancel the session and fail.
    pub endless: Option<Step>,
    pub open_results: VecDeque<bool>,
    pub open_default: bool,
    pub cancel_on_exhaust: Option<CancelToken>,
    pub opens: u32,
    pub failed_opens: u32,
    pub reads: u32,
    pub read_delay: Duration,
}

#[derive(Clone)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self(Arc::new(Mutex::new(Script {
            steps: steps.into_iter().collect(),
            open_default: true,
            ..Script::default()
        })))
    }

    /// Frames forever, one every few milliseconds.
    pub fn endless(people: u8) -> Self {
        let handle = Self::new(Vec::new());
        {
            let mut script = handle.lock();
            script.endless = Some(Step::People(people));
            script.read_delay = Duration::from_millis(2);
        }
        handle
    }

    pub fn lock(&self) -> MutexGuard<'_, Script> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn factory(&self) -> Arc<dyn SourceFactory> {
        Arc::new(ScriptedFactory {
            script: self.clone(),
        })
    }
}

pub struct ScriptedFactory {
    script: ScriptHandle,
}

impl SourceFactory for ScriptedFactory {
    fn create(&self, _target: &CaptureTarget) -> Box<dyn StreamSource> {
        Box::new(ScriptedSource {
            script: self.script.clone(),
            open: false,
        })
    }
}

pub struct ScriptedSource {
    script: ScriptHandle,
    open: bool,
}

impl StreamSource for ScriptedSource {
    fn open(&mut self, address: &str) -> Result<()> {
        let mut script = self.script.lock();
        let ok = script
            .open_results
            .pop_front()
            .unwrap_or(script.open_default);
        if ok {
            script.opens += 1;
            self.open = true;
            Ok(())
        } else {
            script.failed_opens += 1;
            self.open = false;
            Err(anyhow!("cannot reach {}", address))
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("stream not open"));
        }
        let (step, delay) = {
            let mut script = self.script.lock();
            script.reads += 1;
            let step = match script.steps.pop_front().or(script.endless) {
                Some(step) => step,
                None => {
                    if let Some(token) = &script.cancel_on_exhaust {
                        token.cancel();
                    }
                    return Err(anyhow!("script exhausted"));
                }
            };
            (step, script.read_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match step {
            Step::People(count) => Ok(Frame::filled(8, 6, [count, 0, 0])),
            Step::Fail => Err(anyhow!("scripted read failure")),
        }
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Reads the person count from the first pixel and always adds one
/// non-person detection.
pub struct PixelCountBackend;

impl DetectorBackend for PixelCountBackend {
    fn name(&self) -> &'static str {
        "pixel-count"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let people = frame.pixels()[0];
        if people == FAIL_INFERENCE {
            return Err(anyhow!("inference crashed"));
        }
        let mut detections: Vec<Detection> = (0..people)
            .map(|i| Detection {
                x: i as f32,
                y: 0.0,
                w: 1.0,
                h: 1.0,
                confidence: 0.9,
                class_id: 0,
            })
            .collect();
        detections.push(Detection {
            x: 0.0,
            y: 0.0,
            w: 2.0,
            h: 2.0,
            confidence: 0.95,
            class_id: 2,
        });
        Ok(DetectionResult {
            detections,
            inference_ms: Some(4.0),
        })
    }
}

pub fn test_backends() -> Arc<BackendRegistry> {
    let mut backends = BackendRegistry::new();
    backends.register("test", |_, _| Ok(Box::new(PixelCountBackend)));
    backends.register("broken", |path, _| Err(anyhow!("model file {} not found", path)));
    Arc::new(backends)
}

pub fn session_config(window_secs: u64) -> SessionConfig {
    SessionConfig {
        model_path: TEST_MODEL.to_string(),
        window_secs,
        max_frame_height: 1080,
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_attempts: 0,
        },
    }
}

pub fn deps(script: &ScriptHandle, store: Arc<dyn OccupancyStore>) -> SessionDeps {
    SessionDeps {
        backends: test_backends(),
        sources: script.factory(),
        store,
    }
}

pub fn load(store: &dyn OccupancyStore, target: TargetRef) -> Result<TargetRecord> {
    store
        .load_target(target)?
        .ok_or_else(|| anyhow!("{} missing from store", target))
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Delegates to an in-memory store but refuses every sample.
#[derive(Default)]
pub struct RejectingSampleStore {
    inner: InMemoryOccupancyStore,
}

impl OccupancyStore for RejectingSampleStore {
    fn register_target(&self, target: CaptureTarget) -> Result<CaptureTarget> {
        self.inner.register_target(target)
    }

    fn load_target(&self, target: TargetRef) -> Result<Option<TargetRecord>> {
        self.inner.load_target(target)
    }

    fn list_targets(&self, kind: TargetKind) -> Result<Vec<TargetRecord>> {
        self.inner.list_targets(kind)
    }

    fn set_status(&self, target: TargetRef, status: TargetStatus) -> Result<()> {
        self.inner.set_status(target, status)
    }

    fn record_connection(&self, target: TargetRef, at_s: u64) -> Result<()> {
        self.inner.record_connection(target, at_s)
    }

    fn touch_last_updated(&self, target: TargetRef, at_s: u64) -> Result<()> {
        self.inner.touch_last_updated(target, at_s)
    }

    fn insert_sample(&self, _sample: &NewSample) -> Result<i64> {
        Err(anyhow!("database is locked"))
    }

    fn recent_samples(&self, target: TargetRef, limit: usize) -> Result<Vec<OccupancySample>> {
        self.inner.recent_samples(target, limit)
    }
}
