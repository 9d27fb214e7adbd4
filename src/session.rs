//! Processing session: one target, one thread, one model.
//!
//! A session loads its own detector, opens the target's stream and folds
//! frames into interval samples until it is stopped or fails for good.
//! Lifecycle:
//!
//! ```text
//! Created -> ModelLoading -> StreamOpening -> Running <-> Reconnecting
//!                                                |
//!                                                v
//!                                     Stopping -> Stopped
//! ```
//!
//! `Error` is reachable from model loading, stream opening and the running
//! loop. The durable target status is written alongside these transitions;
//! a session that ends in `Error` leaves the failure status in place.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::aggregate::{IntervalAggregator, WindowSummary, DEFAULT_WINDOW_SECS};
use crate::cancel::CancelToken;
use crate::detect::{BackendRegistry, PersonDetector, PERSON_CONFIDENCE_THRESHOLD};
use crate::ingest::{SourceFactory, StreamSource};
use crate::processor::{FrameProcessor, MAX_FRAME_HEIGHT};
use crate::storage::{NewSample, OccupancyStore};
use crate::target::{redact_credentials, CaptureTarget, TargetRef, TargetStatus};

pub(crate) const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";

/// Bounded exponential backoff between reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 0 retries forever.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub model_path: String,
    pub window_secs: u64,
    pub max_frame_height: u32,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_path: DEFAULT_MODEL_PATH.to_string(),
            window_secs: DEFAULT_WINDOW_SECS,
            max_frame_height: MAX_FRAME_HEIGHT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    ModelLoading,
    StreamOpening,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::ModelLoading => "model_loading",
            SessionState::StreamOpening => "stream_opening",
            SessionState::Running => "running",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned from a finished session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub target: TargetRef,
    pub final_state: SessionState,
    pub samples_persisted: u64,
    pub frames_processed: u64,
    pub reconnects: u32,
}

/// Shared collaborators every session of a process uses.
#[derive(Clone)]
pub struct SessionDeps {
    pub backends: Arc<BackendRegistry>,
    pub sources: Arc<dyn SourceFactory>,
    pub store: Arc<dyn OccupancyStore>,
}

pub struct ProcessingSession {
    target: CaptureTarget,
    config: SessionConfig,
    deps: SessionDeps,
    cancel: CancelToken,
    state: Arc<Mutex<SessionState>>,
    samples_persisted: u64,
    frames_processed: u64,
    reconnects: u32,
}

impl ProcessingSession {
    pub fn new(target: CaptureTarget, config: SessionConfig, deps: SessionDeps) -> Self {
        Self {
            target,
            config,
            deps,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(SessionState::Created)),
            samples_persisted: 0,
            frames_processed: 0,
            reconnects: 0,
        }
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state_cell(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    /// Run on a dedicated thread named after the target.
    pub fn spawn(self) -> Result<SessionHandle> {
        let target = self.target.target_ref();
        let name = self.target.display_name().to_string();
        let cancel = self.cancel_token();
        let state = self.state_cell();
        let alive = Arc::new(AtomicBool::new(true));
        let running = AliveGuard(alive.clone());
        let join = thread::Builder::new()
            .name(format!("{}-processor-{}", target.kind, target.id))
            .spawn(move || {
                let _running = running;
                self.run()
            })
            .with_context(|| format!("failed to spawn session thread for {}", target))?;
        Ok(SessionHandle {
            target,
            name,
            cancel,
            state,
            alive,
            join: Some(join),
        })
    }

    /// Drive the session to completion on the calling thread.
    pub fn run(mut self) -> SessionReport {
        let final_state = self.run_inner();
        self.set_state(final_state);
        SessionReport {
            target: self.target.target_ref(),
            final_state,
            samples_persisted: self.samples_persisted,
            frames_processed: self.frames_processed,
            reconnects: self.reconnects,
        }
    }

    fn run_inner(&mut self) -> SessionState {
        self.set_state(SessionState::ModelLoading);
        let detector = match self
            .deps
            .backends
            .load(&self.config.model_path, PERSON_CONFIDENCE_THRESHOLD)
        {
            Ok(backend) => PersonDetector::new(backend),
            Err(e) => {
                log::error!(
                    "Failed to load model for {}: {:#}",
                    self.target.display_name(),
                    e
                );
                self.update_status(TargetStatus::Error);
                return SessionState::Error;
            }
        };
        let mut processor = FrameProcessor::with_max_height(detector, self.config.max_frame_height);

        self.set_state(SessionState::StreamOpening);
        let mut source = self.deps.sources.create(&self.target);
        if let Err(e) = self.open_stream(source.as_mut()) {
            log::error!(
                "Failed to open stream for {}: {:#}",
                self.target.display_name(),
                e
            );
            source.close();
            return SessionState::Error;
        }

        self.set_state(SessionState::Running);
        log::info!("Starting processing loop for {}", self.target.display_name());
        let result = self.process_frames(source.as_mut(), &mut processor);
        source.close();

        match result {
            Ok(()) => {
                self.set_state(SessionState::Stopping);
                self.update_status(TargetStatus::Inactive);
                log::info!("Stopped processing for {}", self.target.display_name());
                SessionState::Stopped
            }
            Err(e) => {
                log::error!(
                    "Error in processing loop for {}: {:#}",
                    self.target.display_name(),
                    e
                );
                self.update_status(TargetStatus::Error);
                SessionState::Error
            }
        }
    }

    fn process_frames(
        &mut self,
        source: &mut dyn StreamSource,
        processor: &mut FrameProcessor,
    ) -> Result<()> {
        let fps = self.target.fps();
        let mut aggregator = IntervalAggregator::new(self.config.window_secs);

        while !self.cancel.is_cancelled() {
            let frame = match source.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!(
                        "Failed to read frame from {}: {:#}",
                        self.target.display_name(),
                        e
                    );
                    if !self.reconnect(source)? {
                        break;
                    }
                    aggregator.reset();
                    continue;
                }
            };

            let observation = processor.process(&frame);
            aggregator.add(observation.people_count, observation.inference_ms);
            self.frames_processed += 1;

            if aggregator.should_flush(aggregator.len(), fps) {
                let summary = aggregator.flush();
                self.persist(&summary);
            }
        }
        Ok(())
    }

    /// Open the target's stream and publish the outcome to the store.
    fn open_stream(&self, source: &mut dyn StreamSource) -> Result<()> {
        let opened = self.target.stream_address().and_then(|address| {
            log::info!(
                "Opening stream for {}: {}",
                self.target.display_name(),
                redact_credentials(&address)
            );
            source.open(&address)
        });
        match opened {
            Ok(()) => {
                self.update_status(TargetStatus::Active);
                if self.target.records_connection() {
                    if let Err(e) = self
                        .deps
                        .store
                        .record_connection(self.target.target_ref(), crate::now_s())
                    {
                        log::warn!(
                            "failed to record connection for {}: {:#}",
                            self.target.display_name(),
                            e
                        );
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.update_status(self.target.stream_failure_status());
                Err(e)
            }
        }
    }

    /// Returns Ok(true) once the stream is back, Ok(false) if stopped while
    /// waiting, Err once the attempt budget is spent.
    fn reconnect(&mut self, source: &mut dyn StreamSource) -> Result<bool> {
        self.set_state(SessionState::Reconnecting);
        let policy = self.config.reconnect.clone();
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            attempt += 1;
            source.close();
            match self.open_stream(source) {
                Ok(()) => {
                    self.reconnects += 1;
                    self.set_state(SessionState::Running);
                    log::info!(
                        "Reconnected to {} after {} attempt(s)",
                        self.target.display_name(),
                        attempt
                    );
                    return Ok(true);
                }
                Err(e) => {
                    log::warn!(
                        "Reconnect attempt {} for {} failed: {:#}",
                        attempt,
                        self.target.display_name(),
                        e
                    );
                    if policy.exhausted(attempt) {
                        bail!(
                            "gave up reconnecting to {} after {} attempts",
                            self.target.display_name(),
                            attempt
                        );
                    }
                    if self.cancel.wait_timeout(policy.delay_for(attempt)) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn persist(&mut self, summary: &WindowSummary) {
        let target = self.target.target_ref();
        let sample = NewSample {
            target,
            people_count: summary.people_count,
            frames_processed: summary.frames_processed,
            inference_time_ms: summary.avg_inference_ms,
            timestamp_s: crate::now_s(),
        };
        match self.deps.store.insert_sample(&sample) {
            Ok(_) => {
                self.samples_persisted += 1;
                if let Err(e) = self.deps.store.touch_last_updated(target, sample.timestamp_s) {
                    log::warn!(
                        "failed to stamp last update for {}: {:#}",
                        self.target.display_name(),
                        e
                    );
                }
                log::info!(
                    "Saved count for {}: {} people ({} frames, {:.2}ms)",
                    self.target.display_name(),
                    summary.people_count,
                    summary.frames_processed,
                    summary.avg_inference_ms
                );
            }
            Err(e) => log::error!("Failed to save count: {:#}", e),
        }
    }

    fn update_status(&self, status: TargetStatus) {
        if let Err(e) = self.deps.store.set_status(self.target.target_ref(), status) {
            log::warn!(
                "failed to set status {} for {}: {:#}",
                status,
                self.target.display_name(),
                e
            );
        }
    }

    fn set_state(&self, state: SessionState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// Cleared when the session thread exits, including by panic.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owner's view of a spawned session.
pub struct SessionHandle {
    target: TargetRef,
    name: String,
    cancel: CancelToken,
    state: Arc<Mutex<SessionState>>,
    alive: Arc<AtomicBool>,
    join: Option<JoinHandle<SessionReport>>,
}

impl SessionHandle {
    pub fn target(&self) -> TargetRef {
        self.target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until the session thread finishes, whoever holds its join handle.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Signal the session to stop. Does not wait.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Wait for the session thread. Fails if already joined or if the thread
    /// panicked.
    pub fn join(&mut self) -> Result<SessionReport> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("session for {} already joined", self.target))?;
        join.join()
            .map_err(|_| anyhow!("session thread for {} panicked", self.target))
    }

    pub(crate) fn take_join(&mut self) -> Option<JoinHandle<SessionReport>> {
        self.join.take()
    }
}
