use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::target::{
    CameraTarget, CaptureTarget, RoomTarget, TargetId, TargetKind, TargetRecord, TargetRef,
    TargetStatus,
};

/// A sample about to be persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct NewSample {
    pub target: TargetRef,
    pub people_count: u32,
    pub frames_processed: u32,
    pub inference_time_ms: f64,
    pub timestamp_s: u64,
}

/// A persisted occupancy sample. Rows are immutable once written.
#[derive(Clone, Debug, PartialEq)]
pub struct OccupancySample {
    pub id: i64,
    pub target: TargetRef,
    pub people_count: u32,
    pub frames_processed: u32,
    pub inference_time_ms: f64,
    pub timestamp_s: u64,
}

/// Durable targets and samples.
///
/// Shared by every session, so methods take `&self` and implementations
/// serialise access internally. Sessions only call the status, timestamp and
/// `insert_sample` methods; target registration belongs to the caller.
pub trait OccupancyStore: Send + Sync {
    /// Insert a target. An id of 0 (or less) lets the store assign one.
    /// Returns the stored target with its final id.
    fn register_target(&self, target: CaptureTarget) -> Result<CaptureTarget>;

    fn load_target(&self, target: TargetRef) -> Result<Option<TargetRecord>>;

    fn list_targets(&self, kind: TargetKind) -> Result<Vec<TargetRecord>>;

    fn set_status(&self, target: TargetRef, status: TargetStatus) -> Result<()>;

    fn record_connection(&self, target: TargetRef, at_s: u64) -> Result<()>;

    fn touch_last_updated(&self, target: TargetRef, at_s: u64) -> Result<()>;

    /// Single-row insert; returns the new sample id.
    fn insert_sample(&self, sample: &NewSample) -> Result<i64>;

    /// Newest first.
    fn recent_samples(&self, target: TargetRef, limit: usize) -> Result<Vec<OccupancySample>>;
}

pub struct SqliteOccupancyStore {
    conn: Mutex<Connection>,
}

impl SqliteOccupancyStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS cameras (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              host TEXT NOT NULL,
              port INTEGER NOT NULL,
              rtsp_path TEXT NOT NULL,
              username TEXT,
              password TEXT,
              fps INTEGER NOT NULL,
              location TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              status TEXT NOT NULL DEFAULT 'inactive',
              last_connection INTEGER,
              last_updated INTEGER
            );

            CREATE TABLE IF NOT EXISTS rooms (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE,
              camera_ip TEXT NOT NULL,
              fps INTEGER NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              status TEXT NOT NULL DEFAULT 'inactive',
              last_updated INTEGER
            );

            CREATE TABLE IF NOT EXISTS occupancy_samples (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER REFERENCES cameras(id),
              room_id INTEGER REFERENCES rooms(id),
              people_count INTEGER NOT NULL CHECK (people_count >= 0),
              frames_processed INTEGER NOT NULL CHECK (frames_processed > 0),
              inference_time_ms REAL NOT NULL CHECK (inference_time_ms >= 0),
              created_at INTEGER NOT NULL,
              CHECK ((camera_id IS NULL) <> (room_id IS NULL))
            );

            CREATE INDEX IF NOT EXISTS idx_samples_camera ON occupancy_samples(camera_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_samples_room ON occupancy_samples(room_id, created_at);

            CREATE TRIGGER IF NOT EXISTS occupancy_samples_no_update
            BEFORE UPDATE ON occupancy_samples
            BEGIN
              SELECT RAISE(ABORT, 'occupancy samples are immutable');
            END;

            CREATE TRIGGER IF NOT EXISTS occupancy_samples_no_delete
            BEFORE DELETE ON occupancy_samples
            BEGIN
              SELECT RAISE(ABORT, 'occupancy samples cannot be deleted');
            END;
            "#,
        )?;
        Ok(())
    }
}

fn table_for(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Camera => "cameras",
        TargetKind::Room => "rooms",
    }
}

fn column_for(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Camera => "camera_id",
        TargetKind::Room => "room_id",
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

fn parse_status(raw: String) -> rusqlite::Result<TargetStatus> {
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn camera_from_row(row: &Row<'_>) -> rusqlite::Result<TargetRecord> {
    let camera = CameraTarget {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        rtsp_path: row.get(4)?,
        username: row.get(5)?,
        password: row.get(6)?,
        fps: row.get(7)?,
        location: row.get(8)?,
        is_active: row.get(9)?,
    };
    Ok(TargetRecord {
        target: CaptureTarget::Camera(camera),
        status: parse_status(row.get(10)?)?,
        last_connection_s: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        last_updated_s: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
    })
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<TargetRecord> {
    let room = RoomTarget {
        id: row.get(0)?,
        name: row.get(1)?,
        camera_ip: row.get(2)?,
        fps: row.get(3)?,
        is_active: row.get(4)?,
    };
    Ok(TargetRecord {
        target: CaptureTarget::Room(room),
        status: parse_status(row.get(5)?)?,
        last_connection_s: None,
        last_updated_s: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

const CAMERA_COLUMNS: &str = "id, name, host, port, rtsp_path, username, password, fps, location, \
                              is_active, status, last_connection, last_updated";
const ROOM_COLUMNS: &str = "id, name, camera_ip, fps, is_active, status, last_updated";

impl OccupancyStore for SqliteOccupancyStore {
    fn register_target(&self, target: CaptureTarget) -> Result<CaptureTarget> {
        target.validate()?;
        let conn = self.lock()?;
        let id = match &target {
            CaptureTarget::Camera(camera) => {
                conn.execute(
                    r#"
                    INSERT INTO cameras(id, name, host, port, rtsp_path, username, password, fps, location, is_active)
                    VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    params![
                        camera.id.max(0),
                        camera.name,
                        camera.host,
                        camera.port,
                        camera.rtsp_path,
                        camera.username,
                        camera.password,
                        camera.fps,
                        camera.location,
                        camera.is_active
                    ],
                )?;
                conn.last_insert_rowid()
            }
            CaptureTarget::Room(room) => {
                conn.execute(
                    r#"
                    INSERT INTO rooms(id, name, camera_ip, fps, is_active)
                    VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5)
                    "#,
                    params![room.id.max(0), room.name, room.camera_ip, room.fps, room.is_active],
                )?;
                conn.last_insert_rowid()
            }
        };
        Ok(with_id(target, id))
    }

    fn load_target(&self, target: TargetRef) -> Result<Option<TargetRecord>> {
        let conn = self.lock()?;
        let record = match target.kind {
            TargetKind::Camera => conn
                .query_row(
                    &format!("SELECT {} FROM cameras WHERE id = ?1", CAMERA_COLUMNS),
                    params![target.id],
                    camera_from_row,
                )
                .optional()?,
            TargetKind::Room => conn
                .query_row(
                    &format!("SELECT {} FROM rooms WHERE id = ?1", ROOM_COLUMNS),
                    params![target.id],
                    room_from_row,
                )
                .optional()?,
        };
        Ok(record)
    }

    fn list_targets(&self, kind: TargetKind) -> Result<Vec<TargetRecord>> {
        let conn = self.lock()?;
        let mut stmt = match kind {
            TargetKind::Camera => {
                conn.prepare(&format!("SELECT {} FROM cameras ORDER BY id ASC", CAMERA_COLUMNS))?
            }
            TargetKind::Room => {
                conn.prepare(&format!("SELECT {} FROM rooms ORDER BY id ASC", ROOM_COLUMNS))?
            }
        };
        let rows = match kind {
            TargetKind::Camera => stmt.query_map([], camera_from_row)?.collect::<Vec<_>>(),
            TargetKind::Room => stmt.query_map([], room_from_row)?.collect::<Vec<_>>(),
        };
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn set_status(&self, target: TargetRef, status: TargetStatus) -> Result<()> {
        let updated = self.lock()?.execute(
            &format!("UPDATE {} SET status = ?1 WHERE id = ?2", table_for(target.kind)),
            params![status.as_str(), target.id],
        )?;
        if updated == 0 {
            return Err(anyhow!("{} not found", target));
        }
        Ok(())
    }

    fn record_connection(&self, target: TargetRef, at_s: u64) -> Result<()> {
        if target.kind != TargetKind::Camera {
            return Err(anyhow!("{} does not track connection time", target));
        }
        let updated = self.lock()?.execute(
            "UPDATE cameras SET last_connection = ?1 WHERE id = ?2",
            params![to_i64(at_s, "connection time")?, target.id],
        )?;
        if updated == 0 {
            return Err(anyhow!("{} not found", target));
        }
        Ok(())
    }

    fn touch_last_updated(&self, target: TargetRef, at_s: u64) -> Result<()> {
        let updated = self.lock()?.execute(
            &format!(
                "UPDATE {} SET last_updated = ?1 WHERE id = ?2",
                table_for(target.kind)
            ),
            params![to_i64(at_s, "update time")?, target.id],
        )?;
        if updated == 0 {
            return Err(anyhow!("{} not found", target));
        }
        Ok(())
    }

    fn insert_sample(&self, sample: &NewSample) -> Result<i64> {
        let created_at = to_i64(sample.timestamp_s, "sample timestamp")?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                r#"
                INSERT INTO occupancy_samples({}, people_count, frames_processed, inference_time_ms, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                column_for(sample.target.kind)
            ),
            params![
                sample.target.id,
                sample.people_count,
                sample.frames_processed,
                sample.inference_time_ms,
                created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn recent_samples(&self, target: TargetRef, limit: usize) -> Result<Vec<OccupancySample>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT id, people_count, frames_processed, inference_time_ms, created_at
            FROM occupancy_samples WHERE {} = ?1
            ORDER BY created_at DESC, id DESC LIMIT ?2
            "#,
            column_for(target.kind)
        ))?;
        let rows = stmt.query_map(params![target.id, limit as i64], |row| {
            Ok(OccupancySample {
                id: row.get(0)?,
                target,
                people_count: row.get(1)?,
                frames_processed: row.get(2)?,
                inference_time_ms: row.get(3)?,
                timestamp_s: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn with_id(target: CaptureTarget, id: TargetId) -> CaptureTarget {
    match target {
        CaptureTarget::Camera(camera) => CaptureTarget::Camera(CameraTarget { id, ..camera }),
        CaptureTarget::Room(room) => CaptureTarget::Room(RoomTarget { id, ..room }),
    }
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InMemoryState {
    cameras: BTreeMap<TargetId, TargetRecord>,
    rooms: BTreeMap<TargetId, TargetRecord>,
    samples: Vec<OccupancySample>,
}

impl InMemoryState {
    fn table(&mut self, kind: TargetKind) -> &mut BTreeMap<TargetId, TargetRecord> {
        match kind {
            TargetKind::Camera => &mut self.cameras,
            TargetKind::Room => &mut self.rooms,
        }
    }

    fn record_mut(&mut self, target: TargetRef) -> Result<&mut TargetRecord> {
        self.table(target.kind)
            .get_mut(&target.id)
            .ok_or_else(|| anyhow!("{} not found", target))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOccupancyStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryOccupancyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))
    }
}

impl OccupancyStore for InMemoryOccupancyStore {
    fn register_target(&self, target: CaptureTarget) -> Result<CaptureTarget> {
        target.validate()?;
        let mut state = self.lock()?;
        let table = state.table(target.kind());
        let id = if target.id() > 0 {
            if table.contains_key(&target.id()) {
                return Err(anyhow!("{} already exists", target.target_ref()));
            }
            target.id()
        } else {
            table.keys().next_back().copied().unwrap_or(0) + 1
        };
        let target = with_id(target, id);
        table.insert(id, TargetRecord::new(target.clone()));
        Ok(target)
    }

    fn load_target(&self, target: TargetRef) -> Result<Option<TargetRecord>> {
        Ok(self.lock()?.table(target.kind).get(&target.id).cloned())
    }

    fn list_targets(&self, kind: TargetKind) -> Result<Vec<TargetRecord>> {
        Ok(self.lock()?.table(kind).values().cloned().collect())
    }

    fn set_status(&self, target: TargetRef, status: TargetStatus) -> Result<()> {
        self.lock()?.record_mut(target)?.status = status;
        Ok(())
    }

    fn record_connection(&self, target: TargetRef, at_s: u64) -> Result<()> {
        if target.kind != TargetKind::Camera {
            return Err(anyhow!("{} does not track connection time", target));
        }
        self.lock()?.record_mut(target)?.last_connection_s = Some(at_s);
        Ok(())
    }

    fn touch_last_updated(&self, target: TargetRef, at_s: u64) -> Result<()> {
        self.lock()?.record_mut(target)?.last_updated_s = Some(at_s);
        Ok(())
    }

    fn insert_sample(&self, sample: &NewSample) -> Result<i64> {
        if sample.frames_processed == 0 {
            return Err(anyhow!("sample must cover at least one frame"));
        }
        if !(sample.inference_time_ms >= 0.0) {
            return Err(anyhow!("inference time must be non-negative"));
        }
        let mut state = self.lock()?;
        if !state.table(sample.target.kind).contains_key(&sample.target.id) {
            return Err(anyhow!("{} not found", sample.target));
        }
        let id = state.samples.len() as i64 + 1;
        state.samples.push(OccupancySample {
            id,
            target: sample.target,
            people_count: sample.people_count,
            frames_processed: sample.frames_processed,
            inference_time_ms: sample.inference_time_ms,
            timestamp_s: sample.timestamp_s,
        });
        Ok(id)
    }

    fn recent_samples(&self, target: TargetRef, limit: usize) -> Result<Vec<OccupancySample>> {
        let state = self.lock()?;
        Ok(state
            .samples
            .iter()
            .rev()
            .filter(|sample| sample.target == target)
            .take(limit)
            .cloned()
            .collect())
    }
}
