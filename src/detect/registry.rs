use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use super::backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
use super::backends::TractBackend;
use super::backends::StubBackend;

/// Builds a backend from a model path and a confidence threshold.
pub type BackendLoader =
    dyn Fn(&str, f32) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static;

/// Resolves model-path strings to detector backends.
///
/// Loaders are keyed by URL scheme (`stub://...`) or, for plain paths, by
/// lower-cased file extension (`yolov8n.onnx`). The registry is shared by
/// every session; each `load` call produces a fresh backend that the calling
/// session owns outright.
pub struct BackendRegistry {
    loaders: HashMap<String, Arc<BackendLoader>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry with the built-in loaders for this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |path, threshold| {
            Ok(Box::new(StubBackend::from_model_path(path)?.with_threshold(threshold)))
        });
        #[cfg(feature = "backend-tract")]
        registry.register("onnx", |path, threshold| {
            Ok(Box::new(TractBackend::new(path)?.with_threshold(threshold)))
        });
        registry
    }

    /// Register a loader, replacing any previous loader for the same key.
    pub fn register<F>(&mut self, key: &str, loader: F)
    where
        F: Fn(&str, f32) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.loaders
            .insert(key.to_ascii_lowercase(), Arc::new(loader));
    }

    /// List registered loader keys.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.loaders.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Load and warm up a backend for `model_path`.
    pub fn load(&self, model_path: &str, confidence_threshold: f32) -> Result<Box<dyn DetectorBackend>> {
        let key = loader_key(model_path)?;
        let loader = self
            .loaders
            .get(&key)
            .ok_or_else(|| anyhow!("no detector backend registered for '{}' models", key))?;
        let mut backend = loader(model_path, confidence_threshold)
            .with_context(|| format!("failed to load model {}", model_path))?;
        backend
            .warm_up()
            .with_context(|| format!("warm-up failed for {} backend", backend.name()))?;
        log::info!("detector model loaded: {} ({})", model_path, backend.name());
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn loader_key(model_path: &str) -> Result<String> {
    let model_path = model_path.trim();
    if model_path.is_empty() {
        return Err(anyhow!("model path is empty"));
    }
    if let Some((scheme, _)) = model_path.split_once("://") {
        return Ok(scheme.to_ascii_lowercase());
    }
    Path::new(model_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("cannot infer model format from '{}'", model_path))
}
