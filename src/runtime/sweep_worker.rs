use super::{sleep_with_stop, WorkerEvent};
use crate::config::Settings;
use crate::executor;
use crate::queue::{self, OutboundMessage, QueuePaths};
use crate::shared::logging::append_runtime_log;
use crate::shared::now_secs;
use crate::store::{StoreError, TaskStore};
use crate::workflow::TaskState;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub reclaimed: usize,
}

/// One reconciliation pass: fail tasks stuck in Processing past their
/// wall-clock deadline (a crashed worker leaves no completion callback), and
/// reclaim tasks whose TTL has lapsed.
pub fn run_sweep_once(state_root: &Path, store: &TaskStore) -> Result<SweepReport, String> {
    let now = now_secs();
    let mut report = SweepReport::default();
    let paths = QueuePaths::from_state_root(state_root);

    for record in store.stuck_processing(now).map_err(|e| e.to_string())? {
        let failed = store.with_task(&record.sender_id, |task| {
            if task.task_id != record.task_id {
                return Err(StoreError::NotFound {
                    sender_id: record.sender_id.clone(),
                });
            }
            task.transition(TaskState::Failed, now, Some("timed out".to_string()))
        });
        match failed {
            Ok(updated) => {
                let _ = queue::write_outbound(
                    &paths,
                    &OutboundMessage {
                        sender_id: updated.sender_id.clone(),
                        message_id: updated.task_id.clone(),
                        text: "Processing timed out. Start a new workflow to retry.".to_string(),
                        files: Vec::new(),
                        timestamp: now,
                    },
                );
                executor::reclaim_task(state_root, store, &updated);
                append_runtime_log(
                    state_root,
                    "warn",
                    "sweep.timed_out",
                    &format!("task={} sender={}", updated.task_id, updated.sender_id),
                );
                report.timed_out += 1;
            }
            // Already finished or cancelled between the query and the write.
            Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.to_string()),
        }
    }

    for record in store.expired(now).map_err(|e| e.to_string())? {
        if !record.state.is_terminal() {
            let cancelled = store.with_task(&record.sender_id, |task| {
                if task.task_id != record.task_id {
                    return Err(StoreError::NotFound {
                        sender_id: record.sender_id.clone(),
                    });
                }
                task.transition(TaskState::Cancelled, now, Some("expired".to_string()))
            });
            match cancelled {
                Ok(_) => {}
                Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.to_string()),
            }
        }
        executor::reclaim_task(state_root, store, &record);
        append_runtime_log(
            state_root,
            "info",
            "sweep.expired",
            &format!("task={} sender={}", record.task_id, record.sender_id),
        );
        report.reclaimed += 1;
    }

    Ok(report)
}

pub(crate) fn run_sweep_loop(
    worker_id: String,
    state_root: PathBuf,
    settings: Settings,
    stop: Arc<AtomicBool>,
    events: Sender<WorkerEvent>,
) {
    let interval = Duration::from_secs(settings.tasks.sweep_interval_seconds.max(1));
    let store = match TaskStore::open(&state_root) {
        Ok(store) => store,
        Err(err) => {
            let _ = events.send(WorkerEvent::Error {
                worker_id: worker_id.clone(),
                at: now_secs(),
                message: err.to_string(),
                fatal: true,
            });
            let _ = events.send(WorkerEvent::Stopped {
                worker_id,
                at: now_secs(),
            });
            return;
        }
    };

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match run_sweep_once(&state_root, &store) {
            Ok(_) => {
                let _ = events.send(WorkerEvent::Heartbeat {
                    worker_id: worker_id.clone(),
                    at: now_secs(),
                });
            }
            Err(message) => {
                let _ = events.send(WorkerEvent::Error {
                    worker_id: worker_id.clone(),
                    at: now_secs(),
                    message,
                    fatal: false,
                });
            }
        }

        if !sleep_with_stop(&stop, interval) {
            break;
        }
    }

    let _ = events.send(WorkerEvent::Stopped {
        worker_id,
        at: now_secs(),
    });
}
