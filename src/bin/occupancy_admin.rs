//! occupancy_admin - manage targets and inspect recent samples
//!
//! Writes go straight to the occupancy store; a running occupancyd picks up
//! new targets on its next start.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use occupancy_engine::{
    target::DEFAULT_TARGET_FPS, CameraTarget, CaptureTarget, OccupancyStore, RoomTarget,
    SqliteOccupancyStore, TargetKind, TargetRecord, TargetRef,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "OCCUPANCY_DB_PATH", default_value = "occupancy.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register an IP camera reachable over RTSP.
    AddCamera {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = occupancy_engine::target::DEFAULT_RTSP_PORT)]
        port: u16,
        #[arg(long, default_value = occupancy_engine::target::DEFAULT_RTSP_PATH)]
        path: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long, env = "OCCUPANCY_CAMERA_PASSWORD")]
        password: Option<String>,
        #[arg(long, default_value_t = DEFAULT_TARGET_FPS)]
        fps: u32,
        #[arg(long)]
        location: Option<String>,
        /// Register without starting it in occupancyd.
        #[arg(long)]
        inactive: bool,
    },
    /// Register a room watched through a raw stream address.
    AddRoom {
        #[arg(long)]
        name: String,
        /// IP address or full stream URL.
        #[arg(long)]
        camera_ip: String,
        #[arg(long, default_value_t = DEFAULT_TARGET_FPS)]
        fps: u32,
        #[arg(long)]
        inactive: bool,
    },
    /// List targets with their status and latest count.
    List {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<TargetKind>,
    },
    /// Show recent samples for one target.
    Samples {
        #[arg(long, value_parser = parse_kind)]
        kind: TargetKind,
        #[arg(long)]
        id: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn parse_kind(raw: &str) -> Result<TargetKind, String> {
    raw.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let store = SqliteOccupancyStore::open(&args.db)?;

    match args.command {
        Command::AddCamera {
            name,
            host,
            port,
            path,
            username,
            password,
            fps,
            location,
            inactive,
        } => {
            let mut camera = CameraTarget::new(0, &name, &host).with_fps(fps);
            camera.port = port;
            camera.rtsp_path = path;
            camera.username = username;
            camera.password = password;
            camera.location = location;
            camera.is_active = !inactive;
            // Fail early on an address that cannot be composed.
            camera.rtsp_url()?;
            let stored = store.register_target(camera.into())?;
            println!("added {} ({})", stored.target_ref(), stored.display_name());
        }
        Command::AddRoom {
            name,
            camera_ip,
            fps,
            inactive,
        } => {
            let mut room = RoomTarget::new(0, &name, &camera_ip).with_fps(fps);
            room.is_active = !inactive;
            let target = CaptureTarget::from(room);
            target.stream_address()?;
            let stored = store.register_target(target)?;
            println!("added {} ({})", stored.target_ref(), stored.display_name());
        }
        Command::List { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => vec![TargetKind::Camera, TargetKind::Room],
            };
            for kind in kinds {
                for record in store.list_targets(kind)? {
                    print_record(&store, &record)?;
                }
            }
        }
        Command::Samples { kind, id, limit } => {
            let target = TargetRef { kind, id };
            if store.load_target(target)?.is_none() {
                return Err(anyhow!("{} not found", target));
            }
            for sample in store.recent_samples(target, limit)? {
                println!(
                    "{}\t{} people\t{} frames\t{:.2}ms",
                    sample.timestamp_s,
                    sample.people_count,
                    sample.frames_processed,
                    sample.inference_time_ms
                );
            }
        }
    }
    Ok(())
}

fn print_record(store: &SqliteOccupancyStore, record: &TargetRecord) -> Result<()> {
    let target = record.target.target_ref();
    let latest = store
        .recent_samples(target, 1)?
        .first()
        .map(|sample| sample.people_count.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}\t{}\t{}\t{}\tfps={}\tlatest={}",
        target,
        record.target.display_name(),
        record.status,
        if record.target.is_active() { "enabled" } else { "disabled" },
        record.target.fps(),
        latest
    );
    Ok(())
}
