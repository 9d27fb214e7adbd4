//! Occupancy engine
//!
//! Turns live camera and room streams into per-interval occupancy counts.
//!
//! # Architecture
//!
//! Each monitored target gets its own processing session on its own thread:
//!
//! 1. **Detect**: a pluggable person detector runs on every frame.
//! 2. **Ingest**: an RTSP/HTTP stream source hands out decoded frames and is
//!    re-opened with backoff when reads fail.
//! 3. **Aggregate**: per-frame counts fold into one sample per window, taking
//!    the maximum count seen so short crowd peaks survive.
//! 4. **Persist**: samples and target status go to the occupancy store.
//!
//! A `ProcessingRegistry` per target kind guarantees at most one live session
//! per target and exposes liveness for status queries.
//!
//! # Module Structure
//!
//! - `target`: cameras, rooms and their durable status
//! - `frame`: decoded RGB frames
//! - `detect`: detector backends, backend registry, person filter
//! - `ingest`: stream sources (RTSP via GStreamer, synthetic `stub://`)
//! - `processor`, `aggregate`: per-frame and per-window reduction
//! - `session`, `registry`: lifecycle and concurrency
//! - `storage`: SQLite and in-memory occupancy stores

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod aggregate;
pub mod cancel;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod processor;
pub mod registry;
pub mod session;
pub mod storage;
pub mod target;

pub use aggregate::{IntervalAggregator, WindowSummary};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use detect::{
    BackendRegistry, Detection, DetectionResult, DetectorBackend, DetectorOutput, PersonDetector,
};
pub use frame::Frame;
pub use ingest::{RtspSource, RtspSourceFactory, SourceFactory, StreamSource};
pub use processor::{FrameObservation, FrameProcessor};
pub use registry::{ProcessingRegistry, RegistryStatus};
pub use session::{
    ProcessingSession, ReconnectPolicy, SessionConfig, SessionDeps, SessionHandle, SessionReport,
    SessionState,
};
pub use storage::{
    InMemoryOccupancyStore, NewSample, OccupancySample, OccupancyStore, SqliteOccupancyStore,
};
pub use target::{
    CameraTarget, CaptureTarget, RoomTarget, TargetId, TargetKind, TargetRecord, TargetRef,
    TargetStatus,
};

/// A private shared-cache in-memory SQLite URI, unique per call.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:occupancy_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
