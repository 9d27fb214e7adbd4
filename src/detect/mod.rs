//! Person detection.
//!
//! - `DetectorBackend`: pluggable object-detection model (stub, tract/ONNX).
//! - `BackendRegistry`: resolves a model-path string to a loaded backend.
//! - `PersonDetector`: adapter that filters backend output to people and
//!   absorbs inference failures.

mod adapter;
mod backend;
mod backends;
mod registry;
mod result;

pub use adapter::{DetectorOutput, PersonDetector};
pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::StubBackend;
pub use registry::{BackendLoader, BackendRegistry};
pub use result::{non_max_suppression, Detection, DetectionResult, PERSON_CLASS_ID};

/// Minimum confidence for a detection to count. Applied by the backend at
/// load time, not re-checked downstream.
pub const PERSON_CONFIDENCE_THRESHOLD: f32 = 0.45;
