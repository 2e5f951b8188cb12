use super::{queue_worker, sweep_worker, RuntimeError, StatePaths, WorkerEvent};
use crate::config::Settings;
use crate::runtime::bootstrap_state_root;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::append_runtime_log;
use crate::shared::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Stopped,
    Error,
}

impl Default for WorkerState {
    fn default() -> Self {
        WorkerState::Stopped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub last_heartbeat: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub workers: BTreeMap<String, WorkerHealth>,
    pub last_error: Option<String>,
}

const QUEUE_WORKER_ID: &str = "queue_processor";
const SWEEP_WORKER_ID: &str = "reconciliation_sweep";

/// Runs the worker threads until a stop file appears: the queue processor
/// (events + jobs) and the reconciliation sweep. Worker health is persisted
/// atomically after every event so `status` reflects a live picture.
pub fn run_supervisor(state_root: &Path, settings: Settings) -> Result<(), RuntimeError> {
    let paths = StatePaths::new(state_root);
    bootstrap_state_root(&paths)?;

    let stop_path = paths.stop_signal_path();
    if stop_path.exists() {
        let _ = fs::remove_file(&stop_path);
    }

    let mut state = SupervisorState {
        running: true,
        pid: Some(std::process::id()),
        started_at: Some(now_secs()),
        stopped_at: None,
        workers: BTreeMap::from_iter([
            (QUEUE_WORKER_ID.to_string(), WorkerHealth::default()),
            (SWEEP_WORKER_ID.to_string(), WorkerHealth::default()),
        ]),
        last_error: None,
    };
    save_supervisor_state(&paths, &state)?;
    append_runtime_log(
        state_root,
        "info",
        "supervisor.started",
        &format!("pid={} workers=2", std::process::id()),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
    let mut active = BTreeSet::new();
    let mut handles = Vec::new();

    active.insert(QUEUE_WORKER_ID.to_string());
    handles.push(thread::spawn({
        let tx = events_tx.clone();
        let stop = stop.clone();
        let root = paths.root.clone();
        let settings = settings.clone();
        move || {
            let _ = tx.send(WorkerEvent::Started {
                worker_id: QUEUE_WORKER_ID.to_string(),
                at: now_secs(),
            });
            queue_worker::run_queue_processor_loop(
                QUEUE_WORKER_ID.to_string(),
                root,
                settings,
                stop,
                tx,
            );
        }
    }));

    active.insert(SWEEP_WORKER_ID.to_string());
    handles.push(thread::spawn({
        let tx = events_tx.clone();
        let stop = stop.clone();
        let root = paths.root.clone();
        let settings = settings.clone();
        move || {
            let _ = tx.send(WorkerEvent::Started {
                worker_id: SWEEP_WORKER_ID.to_string(),
                at: now_secs(),
            });
            sweep_worker::run_sweep_loop(SWEEP_WORKER_ID.to_string(), root, settings, stop, tx);
        }
    }));
    drop(events_tx);

    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            append_runtime_log(
                &paths.root,
                "info",
                "supervisor.stop.signal",
                "stop file detected",
            );
        }

        match events_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => apply_worker_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let deadline = std::time::Instant::now() + shutdown_wait_timeout();
    while !active.is_empty() && std::time::Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => apply_worker_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !active.is_empty() {
        let message = format!(
            "shutdown timeout waiting for workers: {}",
            active.iter().cloned().collect::<Vec<_>>().join(",")
        );
        state.last_error = Some(message.clone());
        for worker_id in &active {
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.state = WorkerState::Error;
                worker.last_error = Some("shutdown timeout".to_string());
            }
        }
        append_runtime_log(&paths.root, "warn", "supervisor.shutdown.timeout", &message);
    }

    for handle in handles {
        let _ = handle.join();
    }

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(&paths, &state)?;

    let _ = fs::remove_file(paths.stop_signal_path());
    append_runtime_log(
        &paths.root,
        "info",
        "supervisor.stopped",
        "runtime stopped cleanly",
    );
    Ok(())
}

fn shutdown_wait_timeout() -> Duration {
    let seconds = std::env::var("DOCSMITH_SHUTDOWN_TIMEOUT_SECONDS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5);
    Duration::from_secs(seconds)
}

fn apply_worker_event(
    paths: &StatePaths,
    state: &mut SupervisorState,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) {
    match event {
        WorkerEvent::Started { worker_id, at } => {
            let entry = state.workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Running;
            entry.last_heartbeat = Some(at);
            append_runtime_log(&paths.root, "info", "worker.started", &worker_id);
        }
        WorkerEvent::Heartbeat { worker_id, at } => {
            let entry = state.workers.entry(worker_id).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Running;
            }
            entry.last_heartbeat = Some(at);
        }
        WorkerEvent::Error {
            worker_id,
            at,
            message,
            fatal,
        } => {
            let entry = state.workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Error;
            entry.last_heartbeat = Some(at);
            entry.last_error = Some(message.clone());
            append_runtime_log(
                &paths.root,
                if fatal { "error" } else { "warn" },
                "worker.error",
                &format!("{worker_id}: {message}"),
            );
        }
        WorkerEvent::Stopped { worker_id, at } => {
            let entry = state.workers.entry(worker_id.clone()).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Stopped;
            }
            entry.last_heartbeat = Some(at);
            active.remove(&worker_id);
            append_runtime_log(&paths.root, "info", "worker.stopped", &worker_id);
        }
    }

    let _ = save_supervisor_state(paths, state);
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Requests a running supervisor to stop by dropping the stop file it polls.
pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let state = load_supervisor_state(paths)?;
    if !state.running {
        return Err(RuntimeError::NotRunning);
    }
    let path = paths.stop_signal_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(&path, b"stop").map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 performs the permission/liveness check without delivering
    // anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Marks a supervisor state stale when its recorded pid is gone (crash or
/// power loss) so a fresh `start` is not refused forever.
pub fn cleanup_stale_supervisor(paths: &StatePaths) -> Result<bool, RuntimeError> {
    let mut state = load_supervisor_state(paths)?;
    if !state.running {
        return Ok(false);
    }
    if let Some(pid) = state.pid {
        if is_process_alive(pid) {
            return Ok(false);
        }
    }
    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(paths, &state)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn supervisor_state_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".docsmith"));
        bootstrap_state_root(&paths).expect("bootstrap");

        let mut state = SupervisorState {
            running: true,
            pid: Some(42),
            started_at: Some(1),
            ..SupervisorState::default()
        };
        state
            .workers
            .insert("queue_processor".to_string(), WorkerHealth::default());
        save_supervisor_state(&paths, &state).expect("save");
        assert_eq!(load_supervisor_state(&paths).expect("load"), state);
    }

    #[test]
    fn missing_state_file_reads_as_default() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".docsmith"));
        assert_eq!(
            load_supervisor_state(&paths).expect("load"),
            SupervisorState::default()
        );
    }

    #[test]
    fn signal_stop_requires_a_running_supervisor() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".docsmith"));
        bootstrap_state_root(&paths).expect("bootstrap");
        let err = signal_stop(&paths).expect_err("not running");
        assert!(matches!(err, RuntimeError::NotRunning));
    }

    #[test]
    fn stale_supervisor_state_is_cleaned_when_pid_is_gone() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".docsmith"));
        bootstrap_state_root(&paths).expect("bootstrap");

        let stale = SupervisorState {
            running: true,
            pid: Some(999_999_999),
            started_at: Some(1),
            ..SupervisorState::default()
        };
        save_supervisor_state(&paths, &stale).expect("save stale");

        assert!(cleanup_stale_supervisor(&paths).expect("cleanup"));
        let cleaned = load_supervisor_state(&paths).expect("load cleaned");
        assert!(!cleaned.running);
        assert!(cleaned.pid.is_none());
    }
}
