use crate::workflow::{TaskState, WorkflowKind};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// How many recently-seen message ids are retained per sender for router
/// deduplication.
pub const SEEN_MESSAGE_WINDOW: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("corrupt task record for `{sender_id}`: {detail}")]
    Corrupt { sender_id: String, detail: String },
    #[error("sender `{sender_id}` already has an active task")]
    ActiveTaskExists { sender_id: String },
    #[error("no task record for sender `{sender_id}`")]
    NotFound { sender_id: String },
    #[error("task version conflict for sender `{sender_id}` at version {expected}")]
    VersionConflict { sender_id: String, expected: i64 },
    #[error("task state transition `{from}` -> `{to}` is invalid")]
    InvalidTransition { from: TaskState, to: TaskState },
}

fn sql_err(source: rusqlite::Error) -> StoreError {
    StoreError::Sql { source }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHandle {
    pub handle_id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub sender_id: String,
    pub workflow: WorkflowKind,
    pub state: TaskState,
    pub files: Vec<FileHandle>,
    pub metadata: Map<String, Value>,
    pub version: i64,
    pub attempt: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub ttl_deadline: i64,
    pub processing_deadline: Option<i64>,
    pub terminal_reason: Option<String>,
}

impl TaskRecord {
    pub fn new(
        task_id: impl Into<String>,
        sender_id: impl Into<String>,
        workflow: WorkflowKind,
        now: i64,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            sender_id: sender_id.into(),
            workflow,
            state: TaskState::Created,
            files: Vec::new(),
            metadata: Map::new(),
            version: 0,
            attempt: 0,
            created_at: now,
            updated_at: now,
            ttl_deadline: now.saturating_add(ttl_seconds),
            processing_deadline: None,
            terminal_reason: None,
        }
    }

    /// Applies a state change through the transition table. Terminal states
    /// record the human-readable reason; entering any other state clears it.
    pub fn transition(
        &mut self,
        next: TaskState,
        now: i64,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        if !self.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        self.terminal_reason = if next.is_terminal() { reason } else { None };
        Ok(())
    }

    pub fn next_file_order(&self) -> u32 {
        self.files.iter().map(|f| f.order + 1).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    db_path: PathBuf,
}

impl TaskStore {
    pub fn open(state_root: &Path) -> Result<Self, StoreError> {
        let db_path = state_root.join("store").join("tasks.sqlite");
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self { db_path };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    sender_id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL UNIQUE,
                    workflow TEXT NOT NULL,
                    state TEXT NOT NULL,
                    files TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    attempt INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    ttl_deadline INTEGER NOT NULL,
                    processing_deadline INTEGER,
                    terminal_reason TEXT
                );

                CREATE TABLE IF NOT EXISTS seen_messages (
                    sender_id TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    seen_at INTEGER NOT NULL,
                    PRIMARY KEY (sender_id, message_id)
                );
                ",
            )
            .map_err(sql_err)
    }

    pub fn load(&self, sender_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT sender_id, task_id, workflow, state, files, metadata, version,
                        attempt, created_at, updated_at, ttl_deadline, processing_deadline,
                        terminal_reason
                 FROM tasks WHERE sender_id = ?1",
                params![sender_id],
                row_to_raw,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_to_record).transpose()
    }

    /// Inserts a new task. At most one record (terminal or not) may exist per
    /// sender; the caller reclaims terminal leftovers first.
    pub fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        if self.load(&record.sender_id)?.is_some() {
            return Err(StoreError::ActiveTaskExists {
                sender_id: record.sender_id.clone(),
            });
        }
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO tasks (sender_id, task_id, workflow, state, files, metadata,
                                    version, attempt, created_at, updated_at, ttl_deadline,
                                    processing_deadline, terminal_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.sender_id,
                    record.task_id,
                    record.workflow.as_str(),
                    record.state.as_str(),
                    encode_json(&record.files, &record.sender_id)?,
                    encode_json(&record.metadata, &record.sender_id)?,
                    record.version,
                    record.attempt as i64,
                    record.created_at,
                    record.updated_at,
                    record.ttl_deadline,
                    record.processing_deadline,
                    record.terminal_reason,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Optimistic write: succeeds only when the stored version still matches
    /// the version this record was loaded at, then bumps it. A mismatch is a
    /// `VersionConflict`; the caller re-reads and retries at most once.
    pub fn update(&self, record: &mut TaskRecord) -> Result<(), StoreError> {
        let connection = self.connect()?;
        let changed = connection
            .execute(
                "UPDATE tasks
                 SET task_id = ?1, workflow = ?2, state = ?3, files = ?4, metadata = ?5,
                     version = version + 1, attempt = ?6, updated_at = ?7, ttl_deadline = ?8,
                     processing_deadline = ?9, terminal_reason = ?10
                 WHERE sender_id = ?11 AND version = ?12",
                params![
                    record.task_id,
                    record.workflow.as_str(),
                    record.state.as_str(),
                    encode_json(&record.files, &record.sender_id)?,
                    encode_json(&record.metadata, &record.sender_id)?,
                    record.attempt as i64,
                    record.updated_at,
                    record.ttl_deadline,
                    record.processing_deadline,
                    record.terminal_reason,
                    record.sender_id,
                    record.version,
                ],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            if self.load(&record.sender_id)?.is_none() {
                return Err(StoreError::NotFound {
                    sender_id: record.sender_id.clone(),
                });
            }
            return Err(StoreError::VersionConflict {
                sender_id: record.sender_id.clone(),
                expected: record.version,
            });
        }
        record.version += 1;
        Ok(())
    }

    /// Load-mutate-update with the single forced re-read retry the
    /// concurrency model allows on a version conflict.
    pub fn with_task<F>(&self, sender_id: &str, mut mutate: F) -> Result<TaskRecord, StoreError>
    where
        F: FnMut(&mut TaskRecord) -> Result<(), StoreError>,
    {
        for attempt in 0..2 {
            let mut record = self.load(sender_id)?.ok_or_else(|| StoreError::NotFound {
                sender_id: sender_id.to_string(),
            })?;
            mutate(&mut record)?;
            match self.update(&mut record) {
                Ok(()) => return Ok(record),
                Err(StoreError::VersionConflict { .. }) if attempt == 0 => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::VersionConflict {
            sender_id: sender_id.to_string(),
            expected: -1,
        })
    }

    pub fn delete(&self, sender_id: &str) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection
            .execute("DELETE FROM tasks WHERE sender_id = ?1", params![sender_id])
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    /// Tasks stuck in Processing past their wall-clock deadline; the sweep
    /// fails these to recover from crashed workers.
    pub fn stuck_processing(&self, now: i64) -> Result<Vec<TaskRecord>, StoreError> {
        self.select_many(
            "SELECT sender_id, task_id, workflow, state, files, metadata, version,
                    attempt, created_at, updated_at, ttl_deadline, processing_deadline,
                    terminal_reason
             FROM tasks
             WHERE state = 'processing' AND processing_deadline IS NOT NULL
               AND processing_deadline < ?1
             ORDER BY sender_id",
            now,
        )
    }

    pub fn expired(&self, now: i64) -> Result<Vec<TaskRecord>, StoreError> {
        self.select_many(
            "SELECT sender_id, task_id, workflow, state, files, metadata, version,
                    attempt, created_at, updated_at, ttl_deadline, processing_deadline,
                    terminal_reason
             FROM tasks WHERE ttl_deadline < ?1 ORDER BY sender_id",
            now,
        )
    }

    fn select_many(&self, sql: &str, bound: i64) -> Result<Vec<TaskRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(sql).map_err(sql_err)?;
        let rows = statement
            .query_map(params![bound], row_to_raw)
            .map_err(sql_err)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(raw_to_record(row.map_err(sql_err)?)?);
        }
        Ok(records)
    }

    /// True when the message id is inside the sender's recent-window, i.e. a
    /// redelivery of an event that was already routed to completion.
    pub fn seen_recently(&self, sender_id: &str, message_id: &str) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let found: Option<i64> = connection
            .query_row(
                "SELECT seen_at FROM seen_messages WHERE sender_id = ?1 AND message_id = ?2",
                params![sender_id, message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(found.is_some())
    }

    /// Records a successfully routed message id and prunes the window to the
    /// most recent entries. Recording happens only after routing succeeds so
    /// an aborted event stays retryable on redelivery.
    pub fn mark_seen(
        &self,
        sender_id: &str,
        message_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT OR IGNORE INTO seen_messages (sender_id, message_id, seen_at)
                 VALUES (?1, ?2, ?3)",
                params![sender_id, message_id, now],
            )
            .map_err(sql_err)?;
        connection
            .execute(
                "DELETE FROM seen_messages
                 WHERE sender_id = ?1 AND message_id NOT IN (
                     SELECT message_id FROM seen_messages
                     WHERE sender_id = ?1
                     ORDER BY seen_at DESC, message_id DESC
                     LIMIT ?2
                 )",
                params![sender_id, SEEN_MESSAGE_WINDOW as i64],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}

type RawRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<i64>,
    Option<String>,
);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn raw_to_record(raw: RawRow) -> Result<TaskRecord, StoreError> {
    let (
        sender_id,
        task_id,
        workflow_raw,
        state_raw,
        files_raw,
        metadata_raw,
        version,
        attempt,
        created_at,
        updated_at,
        ttl_deadline,
        processing_deadline,
        terminal_reason,
    ) = raw;

    let corrupt = |detail: String| StoreError::Corrupt {
        sender_id: sender_id.clone(),
        detail,
    };
    let workflow = WorkflowKind::parse(&workflow_raw)
        .ok_or_else(|| corrupt(format!("unknown workflow `{workflow_raw}`")))?;
    let state = TaskState::parse(&state_raw)
        .ok_or_else(|| corrupt(format!("unknown state `{state_raw}`")))?;
    let files: Vec<FileHandle> = serde_json::from_str(&files_raw)
        .map_err(|err| corrupt(format!("files column: {err}")))?;
    let metadata: Map<String, Value> = serde_json::from_str(&metadata_raw)
        .map_err(|err| corrupt(format!("metadata column: {err}")))?;

    Ok(TaskRecord {
        task_id,
        sender_id,
        workflow,
        state,
        files,
        metadata,
        version,
        attempt: attempt.max(0) as u32,
        created_at,
        updated_at,
        ttl_deadline,
        processing_deadline,
        terminal_reason,
    })
}

fn encode_json<T: Serialize>(value: &T, sender_id: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
        sender_id: sender_id.to_string(),
        detail: format!("serialize: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(sender: &str) -> TaskRecord {
        TaskRecord::new("task-1-aaaa", sender, WorkflowKind::Merge, 100, 3_600)
    }

    #[test]
    fn insert_load_round_trip_preserves_the_record() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::open(dir.path()).expect("open");
        let mut record = sample("u1");
        record.files.push(FileHandle {
            handle_id: "m1".to_string(),
            name: "a.pdf".to_string(),
            path: PathBuf::from("/tmp/a.pdf"),
            size: 10,
            order: 0,
        });
        record
            .metadata
            .insert("pageCount".to_string(), Value::from(3));
        store.insert(&record).expect("insert");

        let loaded = store.load("u1").expect("load").expect("present");
        assert_eq!(loaded, record);
    }

    #[test]
    fn second_task_per_sender_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::open(dir.path()).expect("open");
        store.insert(&sample("u1")).expect("first insert");
        let err = store.insert(&sample("u1")).expect_err("second insert");
        assert!(matches!(err, StoreError::ActiveTaskExists { .. }));
    }

    #[test]
    fn stale_version_update_conflicts_and_fresh_read_succeeds() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::open(dir.path()).expect("open");
        store.insert(&sample("u1")).expect("insert");

        let mut first = store.load("u1").expect("load").expect("present");
        let mut second = first.clone();
        first.updated_at = 200;
        store.update(&mut first).expect("first update");
        assert_eq!(first.version, 1);

        second.updated_at = 300;
        let err = store.update(&mut second).expect_err("stale write");
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let updated = store
            .with_task("u1", |task| {
                task.updated_at = 300;
                Ok(())
            })
            .expect("retry path");
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn transition_helper_enforces_the_table() {
        let mut record = sample("u1");
        record
            .transition(TaskState::CollectingInput, 110, None)
            .expect("legal");
        let err = record
            .transition(TaskState::Completed, 120, None)
            .expect_err("illegal");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        record
            .transition(TaskState::Cancelled, 130, Some("cancelled".to_string()))
            .expect("cancel anywhere");
        assert_eq!(record.terminal_reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn sweep_queries_find_stuck_and_expired_tasks() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::open(dir.path()).expect("open");

        let mut stuck = sample("worker-crash");
        stuck.state = TaskState::Processing;
        stuck.processing_deadline = Some(500);
        store.insert(&stuck).expect("insert stuck");

        let mut old = sample("idle");
        old.sender_id = "idle".to_string();
        old.task_id = "task-2-bbbb".to_string();
        old.ttl_deadline = 400;
        store.insert(&old).expect("insert old");

        let stuck_rows = store.stuck_processing(600).expect("stuck query");
        assert_eq!(stuck_rows.len(), 1);
        assert_eq!(stuck_rows[0].sender_id, "worker-crash");

        let expired_rows = store.expired(600).expect("expired query");
        assert_eq!(expired_rows.len(), 1);
        assert_eq!(expired_rows[0].sender_id, "idle");
    }

    #[test]
    fn duplicate_message_ids_are_reported_within_the_window() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::open(dir.path()).expect("open");
        assert!(!store.seen_recently("u1", "m1").expect("fresh"));
        store.mark_seen("u1", "m1", 10).expect("mark");
        assert!(store.seen_recently("u1", "m1").expect("dup"));
        assert!(!store.seen_recently("u2", "m1").expect("other sender"));

        for idx in 0..(SEEN_MESSAGE_WINDOW + 4) {
            store
                .mark_seen("u1", &format!("fill-{idx}"), 20 + idx as i64)
                .expect("fill");
        }
        // m1 has been pruned out of the window, so it counts as fresh again.
        assert!(!store.seen_recently("u1", "m1").expect("pruned"));
    }
}
