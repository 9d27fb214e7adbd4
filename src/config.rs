use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::aggregate::DEFAULT_WINDOW_SECS;
use crate::processor::MAX_FRAME_HEIGHT;
use crate::session::{ReconnectPolicy, SessionConfig, DEFAULT_MODEL_PATH};

const DEFAULT_DB_PATH: &str = "occupancy.db";
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    db_path: Option<String>,
    model_path: Option<String>,
    window_secs: Option<u64>,
    max_frame_height: Option<u32>,
    reconnect: Option<ReconnectConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub model_path: String,
    pub window_secs: u64,
    pub max_frame_height: u32,
    pub reconnect: ReconnectPolicy,
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OCCUPANCY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let reconnect = file.reconnect.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            model_path: file
                .model_path
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
            window_secs: file.window_secs.unwrap_or(DEFAULT_WINDOW_SECS),
            max_frame_height: file.max_frame_height.unwrap_or(MAX_FRAME_HEIGHT),
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(
                    reconnect
                        .initial_backoff_ms
                        .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
                ),
                max_backoff: Duration::from_millis(
                    reconnect.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
                ),
                max_attempts: reconnect.max_attempts.unwrap_or(0),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("OCCUPANCY_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(path) = std::env::var("OCCUPANCY_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model_path = path;
            }
        }
        if let Some(secs) = env_number("OCCUPANCY_WINDOW_SECS", "an integer number of seconds")? {
            self.window_secs = secs;
        }
        if let Some(height) = env_number("OCCUPANCY_MAX_FRAME_HEIGHT", "an integer pixel height")? {
            self.max_frame_height = height;
        }
        if let Some(attempts) = env_number("OCCUPANCY_RECONNECT_MAX_ATTEMPTS", "an integer")? {
            self.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = env_number("OCCUPANCY_RECONNECT_INITIAL_MS", "an integer number of milliseconds")? {
            self.reconnect.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("OCCUPANCY_RECONNECT_MAX_MS", "an integer number of milliseconds")? {
            self.reconnect.max_backoff = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.model_path.trim().is_empty() {
            return Err(anyhow!("model_path must not be empty"));
        }
        if self.window_secs == 0 {
            return Err(anyhow!("window_secs must be greater than zero"));
        }
        if self.max_frame_height == 0 {
            return Err(anyhow!("max_frame_height must be greater than zero"));
        }
        if self.reconnect.initial_backoff.is_zero() {
            return Err(anyhow!("reconnect initial backoff must be greater than zero"));
        }
        if self.reconnect.max_backoff < self.reconnect.initial_backoff {
            return Err(anyhow!(
                "reconnect max backoff must not be shorter than the initial backoff"
            ));
        }
        Ok(())
    }

    /// Per-session settings derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model_path: self.model_path.clone(),
            window_secs: self.window_secs,
            max_frame_height: self.max_frame_height,
            reconnect: self.reconnect.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, expected)),
        _ => Ok(None),
    }
}
