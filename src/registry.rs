//! Processing registry: at most one live session per target id.
//!
//! One registry serves one target kind. Status here comes from thread
//! liveness only and is independent of the durable target status a session
//! writes to the store; the two can disagree (a room whose session is still
//! reconnecting reads `Running` here and `offline` in the store).

use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::session::{
    ProcessingSession, SessionConfig, SessionDeps, SessionHandle, SessionReport, SessionState,
};
use crate::target::{CaptureTarget, TargetId, TargetKind, TargetRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryStatus {
    NotStarted,
    Running,
    Stopped,
}

impl RegistryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryStatus::NotStarted => "not_started",
            RegistryStatus::Running => "running",
            RegistryStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ProcessingRegistry {
    kind: TargetKind,
    config: SessionConfig,
    deps: SessionDeps,
    sessions: Mutex<HashMap<TargetId, SessionHandle>>,
}

impl ProcessingRegistry {
    pub fn new(kind: TargetKind, config: SessionConfig, deps: SessionDeps) -> Self {
        Self {
            kind,
            config,
            deps,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TargetId, SessionHandle>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("processing registry lock poisoned"))
    }

    /// Start a session for `target`. Returns false if one is already alive.
    pub fn start(&self, target: CaptureTarget) -> Result<bool> {
        if target.kind() != self.kind {
            bail!(
                "{} registry cannot start {}",
                self.kind,
                target.target_ref()
            );
        }
        let id = target.id();
        let mut sessions = self.lock()?;
        if let Some(existing) = sessions.get(&id) {
            if existing.is_alive() {
                log::warn!(
                    "Processing already running for {} {}",
                    self.kind,
                    target.display_name()
                );
                return Ok(false);
            }
        }
        if let Some(mut finished) = sessions.remove(&id) {
            if let Some(join) = finished.take_join() {
                // Already finished, so this does not block.
                let _ = join.join();
            }
        }

        let name = target.display_name().to_string();
        let session = ProcessingSession::new(target, self.config.clone(), self.deps.clone());
        let handle = session.spawn()?;
        sessions.insert(id, handle);
        log::info!("Started processing for {} {} (id {})", self.kind, name, id);
        Ok(true)
    }

    /// Signal the session to stop. False if unknown or no longer alive.
    pub fn stop(&self, id: TargetId) -> Result<bool> {
        let sessions = self.lock()?;
        match sessions.get(&id) {
            Some(handle) if handle.is_alive() => {
                handle.request_stop();
                log::info!(
                    "Stopping processing for {} {}",
                    self.kind,
                    handle.name()
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stop the session and wait for its thread. None if the id was never
    /// started or its thread was already joined.
    pub fn stop_and_wait(&self, id: TargetId) -> Result<Option<SessionReport>> {
        let join = {
            let mut sessions = self.lock()?;
            match sessions.get_mut(&id) {
                Some(handle) => {
                    handle.request_stop();
                    handle.take_join()
                }
                None => None,
            }
        };
        match join {
            Some(join) => {
                let target = TargetRef {
                    kind: self.kind,
                    id,
                };
                join.join()
                    .map(Some)
                    .map_err(|_| anyhow!("session thread for {} panicked", target))
            }
            None => Ok(None),
        }
    }

    pub fn status(&self, id: TargetId) -> Result<RegistryStatus> {
        let sessions = self.lock()?;
        Ok(match sessions.get(&id) {
            None => RegistryStatus::NotStarted,
            Some(handle) if handle.is_alive() => RegistryStatus::Running,
            Some(_) => RegistryStatus::Stopped,
        })
    }

    /// Lifecycle state reported by the session itself.
    pub fn session_state(&self, id: TargetId) -> Result<Option<SessionState>> {
        Ok(self.lock()?.get(&id).map(|handle| handle.state()))
    }

    /// Ids with a live session, ascending.
    pub fn running(&self) -> Result<Vec<TargetId>> {
        let sessions = self.lock()?;
        let mut ids: Vec<TargetId> = sessions
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Stop every session and wait for all of them.
    pub fn shutdown(&self) -> Result<Vec<SessionReport>> {
        let joins = {
            let mut sessions = self.lock()?;
            for handle in sessions.values() {
                handle.request_stop();
            }
            sessions
                .values_mut()
                .filter_map(|handle| handle.take_join())
                .collect::<Vec<_>>()
        };
        let mut reports = Vec::with_capacity(joins.len());
        for join in joins {
            match join.join() {
                Ok(report) => reports.push(report),
                Err(_) => log::error!("a {} session thread panicked", self.kind),
            }
        }
        log::info!(
            "{} registry shut down ({} sessions)",
            self.kind,
            reports.len()
        );
        Ok(reports)
    }
}

impl Drop for ProcessingRegistry {
    fn drop(&mut self) {
        if let Ok(sessions) = self.sessions.get_mut() {
            for handle in sessions.values() {
                handle.request_stop();
            }
        }
    }
}
