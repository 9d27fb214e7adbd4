//! Stream sources.
//!
//! A `StreamSource` opens a video address, hands out decoded frames one at a
//! time and can be re-opened after a failure. Sources keep at most one
//! decoded frame buffered so the processing loop always sees the most recent
//! picture rather than a backlog.
//!
//! Provided sources:
//! - `RtspSource`: RTSP/HTTP/MJPEG via GStreamer (feature: rtsp-gstreamer),
//!   with a synthetic backend for `stub://` addresses (tests, demo runs).
//!
//! Every call on a source may block; sources are driven only from their
//! session's own thread.

use anyhow::Result;

use crate::frame::Frame;
use crate::target::CaptureTarget;

pub mod rtsp;

pub use rtsp::{RtspSource, RtspStats};

pub trait StreamSource: Send {
    /// Open (or re-open) the stream at `address`.
    ///
    /// Any previously open stream is released first.
    fn open(&mut self, address: &str) -> Result<()>;

    /// Read the next frame.
    ///
    /// An error covers both end-of-stream and read failures; the caller is
    /// expected to `open` again rather than give up.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the stream. Safe to call when nothing is open.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Builds one fresh, unopened source per processing session.
pub trait SourceFactory: Send + Sync {
    fn create(&self, target: &CaptureTarget) -> Box<dyn StreamSource>;
}

/// Default factory: an `RtspSource` paced at the target's frame rate.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtspSourceFactory;

impl SourceFactory for RtspSourceFactory {
    fn create(&self, target: &CaptureTarget) -> Box<dyn StreamSource> {
        Box::new(RtspSource::new(target.fps()))
    }
}
