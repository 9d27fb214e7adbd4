mod support;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use occupancy_engine::{
    shared_memory_uri, CameraTarget, CaptureTarget, InMemoryOccupancyStore, OccupancyStore,
    ProcessingSession, RoomTarget, SessionState, SqliteOccupancyStore, TargetStatus,
};

use support::{
    deps, load, session_config, wait_until, RejectingSampleStore, ScriptHandle, Step,
    BROKEN_MODEL, FAIL_INFERENCE,
};

fn register(store: &dyn OccupancyStore, target: impl Into<CaptureTarget>) -> Result<CaptureTarget> {
    store.register_target(target.into())
}

/// Run to completion on this thread; the source cancels once its script ends.
fn run_scripted(
    target: CaptureTarget,
    window_secs: u64,
    script: &ScriptHandle,
    store: Arc<dyn OccupancyStore>,
) -> occupancy_engine::SessionReport {
    let session = ProcessingSession::new(target, session_config(window_secs), deps(script, store));
    script.lock().cancel_on_exhaust = Some(session.cancel_token());
    session.run()
}

#[test]
fn one_minute_window_keeps_the_spike() -> Result<()> {
    let store = Arc::new(SqliteOccupancyStore::open(&shared_memory_uri())?);
    let room = register(store.as_ref(), RoomTarget::new(0, "Lecture Hall", "10.0.0.8").with_fps(1))?;

    let mut counts = vec![Step::People(1); 60];
    counts[17] = Step::People(3);
    counts[30] = Step::People(5);
    counts[44] = Step::People(2);
    let script = ScriptHandle::new(counts);

    let report = run_scripted(room.clone(), 60, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Stopped);
    assert_eq!(report.samples_persisted, 1);
    assert_eq!(report.frames_processed, 60);

    let samples = store.recent_samples(room.target_ref(), 10)?;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].people_count, 5);
    assert_eq!(samples[0].frames_processed, 60);
    assert!((samples[0].inference_time_ms - 4.0).abs() < 1e-9);

    let record = load(store.as_ref(), room.target_ref())?;
    assert_eq!(record.status, TargetStatus::Inactive);
    assert!(record.last_updated_s.is_some());
    Ok(())
}

#[test]
fn flush_waits_for_window_times_fps() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Lab", "10.0.0.9").with_fps(3))?;
    // 2 s window at 3 fps: samples after frames 6 and 12, nothing for the last 5.
    let script = ScriptHandle::new(
        [1, 2, 1, 1, 1, 1, 4, 0, 0, 0, 0, 0, 7, 7, 7, 7, 7].map(Step::People),
    );

    let report = run_scripted(room.clone(), 2, &script, store.clone());
    assert_eq!(report.samples_persisted, 2);
    assert_eq!(report.frames_processed, 17);

    let counts: Vec<(u32, u32)> = store
        .recent_samples(room.target_ref(), 10)?
        .iter()
        .map(|s| (s.people_count, s.frames_processed))
        .collect();
    assert_eq!(counts, vec![(4, 6), (2, 6)]);
    Ok(())
}

#[test]
fn unreachable_room_goes_offline_without_samples() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Lab", "10.0.0.250"))?;
    let script = ScriptHandle::new([Step::People(3)]);
    script.lock().open_results.push_back(false);

    let report = run_scripted(room.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Error);
    assert_eq!(report.samples_persisted, 0);
    assert_eq!(script.lock().reads, 0);

    assert_eq!(load(store.as_ref(), room.target_ref())?.status, TargetStatus::Offline);
    assert!(store.recent_samples(room.target_ref(), 10)?.is_empty());
    Ok(())
}

#[test]
fn unreachable_camera_goes_to_error_without_samples() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let camera = register(
        store.as_ref(),
        CameraTarget::new(0, "Gate", "10.0.0.251").with_credentials("admin", "pw"),
    )?;
    let script = ScriptHandle::new([Step::People(3)]);
    script.lock().open_results.push_back(false);

    let report = run_scripted(camera.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Error);

    let record = load(store.as_ref(), camera.target_ref())?;
    assert_eq!(record.status, TargetStatus::Error);
    assert_eq!(record.last_connection_s, None);
    assert!(store.recent_samples(camera.target_ref(), 10)?.is_empty());
    Ok(())
}

#[test]
fn blank_room_address_is_a_stream_failure() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Annex", "   "))?;
    let script = ScriptHandle::new([Step::People(1)]);

    let report = run_scripted(room.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Error);
    assert_eq!(script.lock().opens, 0);
    assert_eq!(script.lock().failed_opens, 0);
    assert_eq!(load(store.as_ref(), room.target_ref())?.status, TargetStatus::Offline);
    Ok(())
}

#[test]
fn camera_open_records_connection_time() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let camera = register(store.as_ref(), CameraTarget::new(0, "Lobby", "10.0.0.12"))?;
    let script = ScriptHandle::new([Step::People(2)]);

    let report = run_scripted(camera.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Stopped);
    assert_eq!(report.samples_persisted, 1);

    let record = load(store.as_ref(), camera.target_ref())?;
    assert!(record.last_connection_s.is_some());
    assert_eq!(record.status, TargetStatus::Inactive);
    Ok(())
}

#[test]
fn read_failure_reconnects_and_restarts_the_window() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Library", "10.0.0.20").with_fps(1))?;

    let mut steps = vec![Step::People(6); 10];
    steps.push(Step::Fail);
    steps.extend(vec![Step::People(1); 60]);
    let script = ScriptHandle::new(steps);

    let report = run_scripted(room.clone(), 60, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Stopped);
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.frames_processed, 70);
    assert_eq!(script.lock().opens, 2);

    // The ten frames before the failure are discarded with the old window.
    let samples = store.recent_samples(room.target_ref(), 10)?;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].people_count, 1);
    assert_eq!(samples[0].frames_processed, 60);
    Ok(())
}

#[test]
fn failed_reconnect_attempts_back_off_until_the_stream_returns() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Gym", "10.0.0.21"))?;
    let script = ScriptHandle::new([Step::People(2), Step::Fail, Step::People(3)]);
    script
        .lock()
        .open_results
        .extend([true, false, false, true]);

    let report = run_scripted(room.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Stopped);
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.samples_persisted, 2);
    assert_eq!(script.lock().failed_opens, 2);
    assert_eq!(load(store.as_ref(), room.target_ref())?.status, TargetStatus::Inactive);
    Ok(())
}

#[test]
fn exhausted_reconnect_budget_ends_in_error() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Cafeteria", "10.0.0.22"))?;
    let script = ScriptHandle::new([Step::People(2), Step::Fail]);
    {
        let mut script = script.lock();
        script.open_results.push_back(true);
        script.open_default = false;
    }

    let mut config = session_config(60);
    config.reconnect.max_attempts = 3;
    let session = ProcessingSession::new(room.clone(), config, deps(&script, store.clone()));
    let report = session.run();

    assert_eq!(report.final_state, SessionState::Error);
    assert_eq!(script.lock().failed_opens, 3);
    assert_eq!(load(store.as_ref(), room.target_ref())?.status, TargetStatus::Error);
    assert!(store.recent_samples(room.target_ref(), 10)?.is_empty());
    Ok(())
}

#[test]
fn model_load_failure_sets_error_for_both_kinds() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let camera = register(store.as_ref(), CameraTarget::new(0, "Dock", "10.0.0.30"))?;
    let room = register(store.as_ref(), RoomTarget::new(0, "Dock Office", "10.0.0.31"))?;

    for target in [camera, room] {
        let script = ScriptHandle::new([Step::People(1)]);
        let mut config = session_config(1);
        config.model_path = BROKEN_MODEL.to_string();
        let report =
            ProcessingSession::new(target.clone(), config, deps(&script, store.clone())).run();

        assert_eq!(report.final_state, SessionState::Error);
        let script = script.lock();
        assert_eq!((script.opens, script.failed_opens), (0, 0));
        assert_eq!(load(store.as_ref(), target.target_ref())?.status, TargetStatus::Error);
    }
    Ok(())
}

#[test]
fn inference_failure_counts_as_empty_frame() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let room = register(store.as_ref(), RoomTarget::new(0, "Studio", "10.0.0.40").with_fps(3))?;
    let script = ScriptHandle::new([
        Step::People(FAIL_INFERENCE),
        Step::People(FAIL_INFERENCE),
        Step::People(FAIL_INFERENCE),
    ]);

    let report = run_scripted(room.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Stopped);

    let samples = store.recent_samples(room.target_ref(), 10)?;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].people_count, 0);
    assert_eq!(samples[0].frames_processed, 3);
    Ok(())
}

#[test]
fn persistence_failure_is_absorbed() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(RejectingSampleStore::default());
    let room = register(store.as_ref(), RoomTarget::new(0, "Hall", "10.0.0.50"))?;
    let script = ScriptHandle::new([Step::People(1), Step::People(2), Step::People(3)]);

    let report = run_scripted(room.clone(), 1, &script, store.clone());
    assert_eq!(report.final_state, SessionState::Stopped);
    assert_eq!(report.frames_processed, 3);
    assert_eq!(report.samples_persisted, 0);

    let record = load(store.as_ref(), room.target_ref())?;
    assert_eq!(record.status, TargetStatus::Inactive);
    assert_eq!(record.last_updated_s, None);
    Ok(())
}

#[test]
fn stop_request_ends_with_inactive_status() -> Result<()> {
    let store: Arc<dyn OccupancyStore> = Arc::new(InMemoryOccupancyStore::new());
    let camera = register(store.as_ref(), CameraTarget::new(0, "Atrium", "10.0.0.60"))?;
    let script = ScriptHandle::endless(2);

    let session = ProcessingSession::new(camera.clone(), session_config(60), deps(&script, store.clone()));
    let mut handle = session.spawn()?;
    let warmed_up = wait_until(Duration::from_secs(5), || {
        handle.state() == SessionState::Running && script.lock().reads > 3
    });
    assert!(warmed_up);
    assert!(handle.is_alive());
    assert_eq!(load(store.as_ref(), camera.target_ref())?.status, TargetStatus::Active);

    handle.request_stop();
    let report = handle.join()?;
    assert_eq!(report.final_state, SessionState::Stopped);
    assert_eq!(handle.state(), SessionState::Stopped);
    assert!(!handle.is_alive());
    assert!(handle.join().is_err());
    assert_eq!(load(store.as_ref(), camera.target_ref())?.status, TargetStatus::Inactive);
    Ok(())
}
