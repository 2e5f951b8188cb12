use super::{sleep_with_stop, WorkerEvent};
use crate::config::Settings;
use crate::executor;
use crate::queue::{
    self, Claimed, InboundEvent, OrderingKey, OutboundMessage, PerKeyScheduler, ProcessingJob,
    QueuePaths,
};
use crate::router::Router;
use crate::shared::logging::append_runtime_log;
use crate::shared::now_secs;
use crate::store::TaskStore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One schedulable unit: an inbound event (ordered per sender) or a
/// processing job (ordered per task).
#[derive(Debug)]
enum WorkItem {
    Event(Claimed<InboundEvent>),
    Job(Claimed<ProcessingJob>),
}

impl WorkItem {
    fn ordering_key(&self) -> OrderingKey {
        match self {
            WorkItem::Event(claimed) => OrderingKey::Sender(claimed.payload.sender_id.clone()),
            WorkItem::Job(claimed) => OrderingKey::Task(claimed.payload.task_id.clone()),
        }
    }
}

#[derive(Debug)]
struct TaskCompletion {
    key: OrderingKey,
    error: Option<String>,
}

fn process_item(state_root: &Path, settings: &Settings, item: WorkItem) -> Result<(), String> {
    let paths = QueuePaths::from_state_root(state_root);
    let store = TaskStore::open(state_root).map_err(|e| e.to_string())?;

    match item {
        WorkItem::Event(claimed) => {
            let router = Router::new(state_root, settings.clone(), store);
            let now = now_secs();
            let replies = match router.route(&claimed.payload, now) {
                Ok(replies) => replies,
                Err(err) => {
                    let _ = queue::requeue_event(&paths, &claimed);
                    return Err(err.to_string());
                }
            };
            for (index, text) in replies.into_iter().enumerate() {
                let message = OutboundMessage {
                    sender_id: claimed.payload.sender_id.clone(),
                    message_id: claimed.payload.message_id.clone(),
                    text: queue::prepare_outbound_text(&text),
                    files: Vec::new(),
                    timestamp: now.saturating_add(index as i64),
                };
                queue::write_outbound(&paths, &message).map_err(|e| e.to_string())?;
            }
            queue::complete_claim(&claimed).map_err(|e| e.to_string())
        }
        WorkItem::Job(claimed) => {
            match executor::execute_job(state_root, settings, &store, &claimed.payload) {
                Ok(()) => queue::complete_claim(&claimed).map_err(|e| e.to_string()),
                Err(err) => {
                    let _ = queue::requeue_job(&paths, &claimed);
                    Err(err)
                }
            }
        }
    }
}

fn claim_into_scheduler(
    paths: &QueuePaths,
    scheduler: &mut PerKeyScheduler<WorkItem>,
    budget: usize,
) -> Result<(), String> {
    let mut remaining = budget;
    while remaining > 0 {
        match queue::claim_oldest_event(paths).map_err(|e| e.to_string())? {
            Some(claimed) => {
                let item = WorkItem::Event(claimed);
                scheduler.enqueue(item.ordering_key(), item);
                remaining -= 1;
            }
            None => break,
        }
    }
    while remaining > 0 {
        match queue::claim_oldest_job(paths).map_err(|e| e.to_string())? {
            Some(claimed) => {
                let item = WorkItem::Job(claimed);
                scheduler.enqueue(item.ordering_key(), item);
                remaining -= 1;
            }
            None => break,
        }
    }
    Ok(())
}

fn requeue_item(paths: &QueuePaths, item: &WorkItem) {
    match item {
        WorkItem::Event(claimed) => {
            let _ = queue::requeue_event(paths, claimed);
        }
        WorkItem::Job(claimed) => {
            let _ = queue::requeue_job(paths, claimed);
        }
    }
}

/// Drains whatever is currently queued and returns the number of items
/// processed. Used by the CLI and by tests; the daemon runs the loop below.
pub fn drain_queue_once(
    state_root: &Path,
    settings: &Settings,
    max_concurrency: usize,
) -> Result<usize, String> {
    let paths = QueuePaths::from_state_root(state_root);
    let mut scheduler = PerKeyScheduler::default();
    claim_into_scheduler(&paths, &mut scheduler, usize::MAX - 1)?;

    let (result_tx, result_rx) = mpsc::channel::<TaskCompletion>();
    let mut in_flight = 0usize;
    let mut processed = 0usize;

    loop {
        let available = max_concurrency.saturating_sub(in_flight);
        if available > 0 {
            for scheduled in scheduler.dequeue_runnable(available) {
                let tx = result_tx.clone();
                let root = state_root.to_path_buf();
                let cfg = settings.clone();
                let _ = thread::spawn(move || {
                    let error = process_item(&root, &cfg, scheduled.value).err();
                    let _ = tx.send(TaskCompletion {
                        key: scheduled.key,
                        error,
                    });
                });
                in_flight += 1;
            }
        }

        if in_flight == 0 {
            break;
        }

        let completion = match result_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(done) => done,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err("queue worker completion channel disconnected".to_string())
            }
        };
        in_flight = in_flight.saturating_sub(1);
        scheduler.complete(&completion.key);
        match completion.error {
            None => processed += 1,
            Some(error) => return Err(error),
        }
    }

    Ok(processed)
}

pub(crate) fn run_queue_processor_loop(
    worker_id: String,
    state_root: PathBuf,
    settings: Settings,
    stop: Arc<AtomicBool>,
    events: Sender<WorkerEvent>,
) {
    let paths = QueuePaths::from_state_root(&state_root);

    match queue::recover_processing_entries(&paths) {
        Ok(recovered) => {
            for path in recovered {
                append_runtime_log(
                    &state_root,
                    "info",
                    "queue.recovered",
                    &format!("requeued {}", path.display()),
                );
            }
        }
        Err(error) => {
            let _ = events.send(WorkerEvent::Error {
                worker_id: worker_id.clone(),
                at: now_secs(),
                message: error.to_string(),
                fatal: false,
            });
        }
    }

    let max_concurrency = settings.queue.max_concurrency;
    let (result_tx, result_rx) = mpsc::channel::<TaskCompletion>();
    let mut scheduler: PerKeyScheduler<WorkItem> = PerKeyScheduler::default();
    let mut in_flight = 0usize;
    let mut backoff_ms = settings.queue.min_poll_ms;

    loop {
        let stopping = stop.load(Ordering::Relaxed);

        if !stopping {
            let budget = max_concurrency.saturating_mul(4);
            if let Err(error) = claim_into_scheduler(&paths, &mut scheduler, budget) {
                let _ = events.send(WorkerEvent::Error {
                    worker_id: worker_id.clone(),
                    at: now_secs(),
                    message: error,
                    fatal: false,
                });
            }
        }

        let available = max_concurrency.saturating_sub(in_flight);
        if !stopping && available > 0 {
            for scheduled in scheduler.dequeue_runnable(available) {
                let tx = result_tx.clone();
                let root = state_root.clone();
                let cfg = settings.clone();
                let _ = thread::spawn(move || {
                    let error = process_item(&root, &cfg, scheduled.value).err();
                    let _ = tx.send(TaskCompletion {
                        key: scheduled.key,
                        error,
                    });
                });
                in_flight += 1;
            }
        }

        while let Ok(done) = result_rx.try_recv() {
            handle_completion(&worker_id, &events, &mut scheduler, &mut in_flight, done);
        }

        if stopping {
            if in_flight == 0 {
                for pending in scheduler.drain_pending() {
                    requeue_item(&paths, &pending.value);
                }
                break;
            }
            match result_rx.recv_timeout(Duration::from_millis(settings.queue.min_poll_ms)) {
                Ok(done) => {
                    handle_completion(&worker_id, &events, &mut scheduler, &mut in_flight, done)
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    in_flight = 0;
                }
            }
            continue;
        }

        if scheduler.pending_len() == 0 && in_flight == 0 {
            let _ = events.send(WorkerEvent::Heartbeat {
                worker_id: worker_id.clone(),
                at: now_secs(),
            });
            if !sleep_with_stop(&stop, Duration::from_millis(backoff_ms)) {
                break;
            }
            backoff_ms = backoff_ms.saturating_mul(2).min(settings.queue.max_poll_ms);
        } else {
            backoff_ms = settings.queue.min_poll_ms;
            thread::sleep(Duration::from_millis(settings.queue.min_poll_ms));
        }
    }

    let _ = events.send(WorkerEvent::Stopped {
        worker_id,
        at: now_secs(),
    });
}

fn handle_completion(
    worker_id: &str,
    events: &Sender<WorkerEvent>,
    scheduler: &mut PerKeyScheduler<WorkItem>,
    in_flight: &mut usize,
    done: TaskCompletion,
) {
    *in_flight = in_flight.saturating_sub(1);
    scheduler.complete(&done.key);
    if let Some(message) = done.error {
        let _ = events.send(WorkerEvent::Error {
            worker_id: worker_id.to_string(),
            at: now_secs(),
            message,
            fatal: false,
        });
    } else {
        let _ = events.send(WorkerEvent::Heartbeat {
            worker_id: worker_id.to_string(),
            at: now_secs(),
        });
    }
}
