use crate::shared::fs_atomic::atomic_write_file;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid queue payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parse_err(path: &Path, source: serde_json::Error) -> QueueError {
    QueueError::Parse {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Command,
    File,
    Text,
}

/// One inbound event from the transport collaborator. File events reference
/// bytes the transport staged on disk; the router copies them into the task
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub sender_id: String,
    pub event_type: EventKind,
    pub message_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub sender_id: String,
    pub message_id: String,
    pub text: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub timestamp: i64,
}

/// A deferred processing step for one task, executed by the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub sender_id: String,
    pub task_id: String,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    pub incoming: PathBuf,
    pub processing: PathBuf,
    pub outgoing: PathBuf,
    pub jobs: PathBuf,
}

impl QueuePaths {
    pub fn from_state_root(state_root: &Path) -> Self {
        Self {
            incoming: state_root.join("queue/incoming"),
            processing: state_root.join("queue/processing"),
            outgoing: state_root.join("queue/outgoing"),
            jobs: state_root.join("queue/jobs"),
        }
    }

    pub fn all(&self) -> [&PathBuf; 4] {
        [&self.incoming, &self.processing, &self.outgoing, &self.jobs]
    }
}

pub const OUTBOUND_MAX_CHARS: usize = 4000;
const OUTBOUND_TRUNCATION_SUFFIX: &str = "\n\n[Response truncated...]";

pub fn prepare_outbound_text(raw: &str) -> String {
    if raw.chars().count() <= OUTBOUND_MAX_CHARS {
        return raw.to_string();
    }
    let keep = OUTBOUND_MAX_CHARS - OUTBOUND_TRUNCATION_SUFFIX.chars().count();
    let mut truncated: String = raw.chars().take(keep).collect();
    truncated.push_str(OUTBOUND_TRUNCATION_SUFFIX);
    truncated
}

/// Ordering keys drive the per-key scheduler: events serialize per sender,
/// processing jobs serialize per task. A cancel event can therefore be routed
/// while a job for the same sender is still running; the store's version
/// check arbitrates the rest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderingKey {
    Sender(String),
    Task(String),
}

#[derive(Debug)]
pub struct Scheduled<T> {
    pub key: OrderingKey,
    pub value: T,
}

/// FIFO scheduler that never runs two items with the same key concurrently
/// and never reorders items within a key.
#[derive(Debug)]
pub struct PerKeyScheduler<T> {
    pending: VecDeque<Scheduled<T>>,
    active_keys: HashSet<OrderingKey>,
}

impl<T> Default for PerKeyScheduler<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            active_keys: HashSet::new(),
        }
    }
}

impl<T> PerKeyScheduler<T> {
    pub fn enqueue(&mut self, key: OrderingKey, value: T) {
        self.pending.push_back(Scheduled { key, value });
    }

    pub fn dequeue_runnable(&mut self, max_items: usize) -> Vec<Scheduled<T>> {
        if max_items == 0 || self.pending.is_empty() {
            return Vec::new();
        }

        let mut selected = Vec::new();
        let mut selected_keys = HashSet::new();
        let mut remaining = VecDeque::new();

        while let Some(item) = self.pending.pop_front() {
            let key_busy =
                self.active_keys.contains(&item.key) || selected_keys.contains(&item.key);
            if !key_busy && selected.len() < max_items {
                selected_keys.insert(item.key.clone());
                self.active_keys.insert(item.key.clone());
                selected.push(item);
            } else {
                remaining.push_back(item);
            }
        }

        self.pending = remaining;
        selected
    }

    pub fn complete(&mut self, key: &OrderingKey) {
        self.active_keys.remove(key);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active_keys.len()
    }

    pub fn drain_pending(&mut self) -> Vec<Scheduled<T>> {
        self.pending.drain(..).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Claimed<T> {
    pub source_path: PathBuf,
    pub processing_path: PathBuf,
    pub payload: T,
}

pub fn sanitize_filename_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn is_queue_json_filename(filename: &str) -> bool {
    let path = Path::new(filename);
    if path.extension().and_then(|v| v.to_str()) != Some("json") {
        return false;
    }
    path.file_stem()
        .and_then(|v| v.to_str())
        .map(|stem| !stem.trim().is_empty())
        .unwrap_or(false)
}

fn sorted_queue_paths(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if !is_queue_json_filename(name) {
                continue;
            }
        }
        let metadata = entry.metadata().map_err(|e| io_err(&path, e))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });

    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

static REQUEUE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_requeue_name(original_name: &str) -> String {
    let path = Path::new(original_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("message");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
    let counter = REQUEUE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    format!("{stem}_requeue_{counter}.{ext}")
}

fn claim_oldest_from<T: DeserializeOwned>(
    source_dir: &Path,
    processing_dir: &Path,
) -> Result<Option<Claimed<T>>, QueueError> {
    for source_path in sorted_queue_paths(source_dir)? {
        let Some(file_name) = source_path.file_name() else {
            continue;
        };
        let processing_path = processing_dir.join(file_name);

        match fs::rename(&source_path, &processing_path) {
            Ok(_) => {
                let raw = match fs::read_to_string(&processing_path) {
                    Ok(raw) => raw,
                    Err(err) => {
                        requeue_file(source_dir, &processing_path)?;
                        return Err(io_err(&processing_path, err));
                    }
                };
                let payload: T = match serde_json::from_str(&raw) {
                    Ok(payload) => payload,
                    Err(err) => {
                        requeue_file(source_dir, &processing_path)?;
                        return Err(parse_err(&processing_path, err));
                    }
                };
                return Ok(Some(Claimed {
                    source_path,
                    processing_path,
                    payload,
                }));
            }
            // Another worker claimed it between the scan and the rename.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&source_path, err)),
        }
    }

    Ok(None)
}

fn requeue_file(origin_dir: &Path, processing_path: &Path) -> Result<PathBuf, QueueError> {
    let file_name = processing_path
        .file_name()
        .and_then(|v| v.to_str())
        .ok_or_else(|| {
            io_err(
                processing_path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "processing file missing name",
                ),
            )
        })?;
    let target = origin_dir.join(unique_requeue_name(file_name));
    fs::rename(processing_path, &target).map_err(|e| io_err(processing_path, e))?;
    Ok(target)
}

pub fn claim_oldest_event(paths: &QueuePaths) -> Result<Option<Claimed<InboundEvent>>, QueueError> {
    claim_oldest_from(&paths.incoming, &paths.processing)
}

pub fn claim_oldest_job(paths: &QueuePaths) -> Result<Option<Claimed<ProcessingJob>>, QueueError> {
    claim_oldest_from(&paths.jobs, &paths.processing)
}

pub fn requeue_event(
    paths: &QueuePaths,
    claimed: &Claimed<InboundEvent>,
) -> Result<PathBuf, QueueError> {
    requeue_file(&paths.incoming, &claimed.processing_path)
}

pub fn requeue_job(
    paths: &QueuePaths,
    claimed: &Claimed<ProcessingJob>,
) -> Result<PathBuf, QueueError> {
    requeue_file(&paths.jobs, &claimed.processing_path)
}

pub fn complete_claim<T>(claimed: &Claimed<T>) -> Result<(), QueueError> {
    fs::remove_file(&claimed.processing_path).map_err(|e| io_err(&claimed.processing_path, e))
}

pub fn enqueue_event(paths: &QueuePaths, event: &InboundEvent) -> Result<PathBuf, QueueError> {
    let name = format!(
        "{}_{}.json",
        sanitize_filename_component(&event.sender_id),
        sanitize_filename_component(&event.message_id),
    );
    let path = paths.incoming.join(name);
    let body = serde_json::to_vec_pretty(event).map_err(|e| parse_err(&path, e))?;
    atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// Jobs are named after the task so their prefix distinguishes them from
/// events inside the shared processing directory.
pub fn enqueue_job(paths: &QueuePaths, job: &ProcessingJob) -> Result<PathBuf, QueueError> {
    let name = format!(
        "job_{}_{}.json",
        sanitize_filename_component(&job.task_id),
        job.enqueued_at,
    );
    let path = paths.jobs.join(name);
    let body = serde_json::to_vec_pretty(job).map_err(|e| parse_err(&path, e))?;
    atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

pub fn write_outbound(
    paths: &QueuePaths,
    message: &OutboundMessage,
) -> Result<PathBuf, QueueError> {
    let name = format!(
        "{}_{}_{}.json",
        sanitize_filename_component(&message.sender_id),
        sanitize_filename_component(&message.message_id),
        message.timestamp,
    );
    let path = paths.outgoing.join(name);
    let body = serde_json::to_vec_pretty(message).map_err(|e| parse_err(&path, e))?;
    atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// Moves entries a crashed worker left in the processing directory back to
/// their origin queue under a collision-free recovered name. Job files are
/// recognized by their `job_` prefix.
pub fn recover_processing_entries(paths: &QueuePaths) -> Result<Vec<PathBuf>, QueueError> {
    let mut recovered = Vec::new();
    let mut entries = Vec::new();

    for entry in fs::read_dir(&paths.processing).map_err(|e| io_err(&paths.processing, e))? {
        let entry = entry.map_err(|e| io_err(&paths.processing, e))?;
        let path = entry.path();
        if path.is_file() {
            entries.push(path);
        }
    }
    entries.sort();

    for (index, processing_path) in entries.into_iter().enumerate() {
        let name = processing_path
            .file_name()
            .and_then(|v| v.to_str())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("message.json");
        let origin = if name.starts_with("job_") {
            &paths.jobs
        } else {
            &paths.incoming
        };
        let target = origin.join(recovered_filename(index, name));
        fs::rename(&processing_path, &target).map_err(|e| io_err(&processing_path, e))?;
        recovered.push(target);
    }

    Ok(recovered)
}

fn recovered_filename(index: usize, name: &str) -> String {
    let prefix = if name.starts_with("job_") { "job_" } else { "" };
    let ext = Path::new(name)
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or("json");
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hash = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{prefix}recovered_{index}_{hash}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_paths(root: &Path) -> QueuePaths {
        let paths = QueuePaths::from_state_root(root);
        for dir in paths.all() {
            fs::create_dir_all(dir).expect("queue dir");
        }
        paths
    }

    fn sample_event(message_id: &str) -> InboundEvent {
        InboundEvent {
            sender_id: "u1".to_string(),
            event_type: EventKind::Command,
            message_id: message_id.to_string(),
            text: Some("merge pdf".to_string()),
            file_name: None,
            file_path: None,
        }
    }

    #[test]
    fn events_are_claimed_oldest_first() {
        let tmp = tempdir().expect("tempdir");
        let paths = make_paths(tmp.path());

        enqueue_event(&paths, &sample_event("a")).expect("enqueue a");
        std::thread::sleep(std::time::Duration::from_millis(5));
        enqueue_event(&paths, &sample_event("b")).expect("enqueue b");

        let claim = claim_oldest_event(&paths).expect("claim").expect("item");
        assert_eq!(claim.payload.message_id, "a");
        assert!(claim.processing_path.exists());
        assert!(!claim.source_path.exists());
    }

    #[test]
    fn requeue_moves_processing_back_under_a_fresh_name() {
        let tmp = tempdir().expect("tempdir");
        let paths = make_paths(tmp.path());
        enqueue_event(&paths, &sample_event("a")).expect("enqueue");

        let claim = claim_oldest_event(&paths).expect("claim").expect("item");
        let requeued = requeue_event(&paths, &claim).expect("requeue");
        assert!(requeued.exists());
        assert!(!claim.processing_path.exists());
        assert!(requeued.starts_with(&paths.incoming));
    }

    #[test]
    fn jobs_and_events_recover_to_their_own_queues() {
        let tmp = tempdir().expect("tempdir");
        let paths = make_paths(tmp.path());

        enqueue_event(&paths, &sample_event("a")).expect("event");
        enqueue_job(
            &paths,
            &ProcessingJob {
                sender_id: "u1".to_string(),
                task_id: "task-1".to_string(),
                enqueued_at: 9,
            },
        )
        .expect("job");
        let _ = claim_oldest_event(&paths).expect("claim event");
        let _ = claim_oldest_job(&paths).expect("claim job");

        let recovered = recover_processing_entries(&paths).expect("recover");
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().any(|p| p.starts_with(&paths.incoming)));
        assert!(recovered.iter().any(|p| p.starts_with(&paths.jobs)));
    }

    #[test]
    fn scheduler_keeps_same_key_items_in_order() {
        let sender = OrderingKey::Sender("u1".to_string());
        let other = OrderingKey::Sender("u2".to_string());

        let mut scheduler = PerKeyScheduler::default();
        scheduler.enqueue(sender.clone(), "a1");
        scheduler.enqueue(sender.clone(), "a2");
        scheduler.enqueue(other.clone(), "b1");

        let batch = scheduler.dequeue_runnable(3);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value, "a1");
        assert_eq!(batch[1].value, "b1");

        assert!(scheduler.dequeue_runnable(3).is_empty());
        scheduler.complete(&sender);
        let next = scheduler.dequeue_runnable(3);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].value, "a2");
    }

    #[test]
    fn sender_events_and_task_jobs_use_distinct_keys() {
        let mut scheduler = PerKeyScheduler::default();
        scheduler.enqueue(OrderingKey::Task("task-1".to_string()), "job");
        scheduler.enqueue(OrderingKey::Sender("u1".to_string()), "cancel");

        // The cancel event is runnable even while the task's job occupies its
        // own key.
        let batch = scheduler.dequeue_runnable(2);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn outbound_text_is_capped() {
        let long = "x".repeat(OUTBOUND_MAX_CHARS + 100);
        let prepared = prepare_outbound_text(&long);
        assert_eq!(prepared.chars().count(), OUTBOUND_MAX_CHARS);
        assert!(prepared.ends_with("[Response truncated...]"));
        assert_eq!(prepare_outbound_text("short"), "short");
    }

    #[test]
    fn outbound_messages_land_in_the_outgoing_directory() {
        let tmp = tempdir().expect("tempdir");
        let paths = make_paths(tmp.path());
        let path = write_outbound(
            &paths,
            &OutboundMessage {
                sender_id: "user@net".to_string(),
                message_id: "m1".to_string(),
                text: "done".to_string(),
                files: vec!["/tmp/out.pdf".to_string()],
                timestamp: 42,
            },
        )
        .expect("write");
        assert!(path.starts_with(&paths.outgoing));
        assert_eq!(
            path.file_name().and_then(|v| v.to_str()),
            Some("user_net_m1_42.json")
        );
        let parsed: OutboundMessage =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(parsed.files, vec!["/tmp/out.pdf".to_string()]);
    }
}
