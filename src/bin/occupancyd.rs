//! occupancyd - occupancy processing daemon
//!
//! This daemon:
//! 1. Loads engine configuration (OCCUPANCY_CONFIG + env overrides)
//! 2. Opens the occupancy store
//! 3. Starts one processing session per active camera and room
//! 4. Logs session liveness periodically
//! 5. Stops and joins every session on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use occupancy_engine::{
    BackendRegistry, EngineConfig, OccupancyStore, ProcessingRegistry, RtspSourceFactory,
    SessionDeps, SqliteOccupancyStore, TargetKind,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Only start these camera ids (default: every active camera).
    #[arg(long = "camera", value_name = "ID")]
    cameras: Vec<i64>,

    /// Only start these room ids (default: every active room).
    #[arg(long = "room", value_name = "ID")]
    rooms: Vec<i64>,

    /// Seconds between liveness log lines.
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = EngineConfig::load()?;
    let store = Arc::new(SqliteOccupancyStore::open(&config.db_path)?);
    let backends = BackendRegistry::with_defaults();
    log::info!(
        "occupancyd running. db={} model={} window={}s backends=[{}]",
        config.db_path,
        config.model_path,
        config.window_secs,
        backends.list().join(", ")
    );

    let deps = SessionDeps {
        backends: Arc::new(backends),
        sources: Arc::new(RtspSourceFactory),
        store: store.clone(),
    };
    let registries = [
        (
            ProcessingRegistry::new(TargetKind::Camera, config.session_config(), deps.clone()),
            args.cameras,
        ),
        (
            ProcessingRegistry::new(TargetKind::Room, config.session_config(), deps),
            args.rooms,
        ),
    ];

    for (registry, only) in &registries {
        for record in store.list_targets(registry.kind())? {
            let target = record.target;
            if !target.is_active() || (!only.is_empty() && !only.contains(&target.id())) {
                continue;
            }
            if let Err(e) = registry.start(target) {
                log::error!("failed to start {} session: {:#}", registry.kind(), e);
            }
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("occupancyd waiting for shutdown signal (Ctrl-C)...");
    let interval = Duration::from_secs(args.status_interval.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for (registry, _) in &registries {
                    let running = registry.running()?;
                    log::info!(
                        "{} sessions running: {} {:?}",
                        registry.kind(),
                        running.len(),
                        running
                    );
                }
            }
            _ => break,
        }
    }

    log::info!("shutdown signal received, stopping sessions...");
    for (registry, _) in &registries {
        for report in registry.shutdown()? {
            log::info!(
                "{} finished in state {}: {} samples, {} frames, {} reconnects",
                report.target,
                report.final_state,
                report.samples_persisted,
                report.frames_processed,
                report.reconnects
            );
        }
    }
    Ok(())
}
