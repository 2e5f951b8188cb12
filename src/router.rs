use crate::config::Settings;
use crate::executor;
use crate::files::{self, FileError};
use crate::queue::{self, EventKind, InboundEvent, ProcessingJob, QueuePaths};
use crate::shared::ids::generate_task_id;
use crate::shared::logging::append_router_log;
use crate::store::{FileHandle, StoreError, TaskRecord, TaskStore};
use crate::tools::{ToolGateway, ToolInvocation};
use crate::workflow::{self, meta, TaskState, ValidationError, WorkflowKind};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HELP_TEXT: &str = "Available commands: 'merge pdf', 'split pdf', 'scan document', \
'word to pdf', 'powerpoint to pdf', 'excel to pdf', 'compress pdf', 'markdown to pdf'. \
During a task: send files or text, then 'done'; 'status' shows progress; 'cancel' aborts.";

const ACTIVE_TASK_GUIDANCE: &str =
    "You already have a task in progress. Send 'done' to finish it or 'cancel' to abort it first.";

const START_NEW_GUIDANCE: &str =
    "That task is finished. Start a new workflow to continue (send 'merge pdf', 'split pdf', ...).";

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error("failed to read staged file {path}: {source}")]
    StagedRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Routes one inbound event against the sender's task. All routing-path
/// store writes go through the optimistic-version helper; long tool work is
/// enqueued, never run here (except the documented synchronous fallback when
/// the job queue is unreachable).
pub struct Router {
    state_root: PathBuf,
    settings: Settings,
    store: TaskStore,
    gateway: ToolGateway,
}

impl Router {
    pub fn new(state_root: impl Into<PathBuf>, settings: Settings, store: TaskStore) -> Self {
        let state_root = state_root.into();
        let gateway = ToolGateway::new(&state_root, settings.tools.capture_limit_bytes);
        Self {
            state_root,
            settings,
            store,
            gateway,
        }
    }

    pub fn route(&self, event: &InboundEvent, now: i64) -> Result<Vec<String>, RouterError> {
        if self
            .store
            .seen_recently(&event.sender_id, &event.message_id)?
        {
            append_router_log(
                &self.state_root,
                now,
                "route.duplicate",
                &format!("sender={} message={}", event.sender_id, event.message_id),
            );
            return Ok(Vec::new());
        }

        let task = self.load_live_task(&event.sender_id, now)?;
        let replies = match event.event_type {
            EventKind::Command => self.route_text(event, task, now),
            EventKind::Text => self.route_text(event, task, now),
            EventKind::File => self.route_file(event, task, now),
        }?;

        // Recorded only after routing succeeded; an aborted event is requeued
        // and must be retryable on redelivery.
        self.store
            .mark_seen(&event.sender_id, &event.message_id, now)?;
        Ok(replies)
    }

    /// Terminal leftovers (cleanup raced or previously failed) are reclaimed
    /// here; the caller then sees no task and the sender can start fresh.
    fn load_live_task(
        &self,
        sender_id: &str,
        now: i64,
    ) -> Result<Option<TaskRecord>, RouterError> {
        let Some(record) = self.store.load(sender_id)? else {
            return Ok(None);
        };
        if record.state.is_terminal() {
            executor::reclaim_task(&self.state_root, &self.store, &record);
            append_router_log(
                &self.state_root,
                now,
                "route.reclaimed_terminal",
                &format!("sender={sender_id} task={}", record.task_id),
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn route_text(
        &self,
        event: &InboundEvent,
        task: Option<TaskRecord>,
        now: i64,
    ) -> Result<Vec<String>, RouterError> {
        let text = event.text.clone().unwrap_or_default();
        let normalized = text.trim().to_lowercase();

        if let Some(kind) = WorkflowKind::from_start_command(&normalized) {
            return match task {
                Some(_) => Ok(vec![ACTIVE_TASK_GUIDANCE.to_string()]),
                None => self.start_task(&event.sender_id, kind, now),
            };
        }

        match normalized.as_str() {
            "cancel" => {
                return match task {
                    Some(record) => self.cancel_task(record, now),
                    None => Ok(vec!["No active task to cancel.".to_string()]),
                }
            }
            "status" => {
                return Ok(vec![match &task {
                    Some(record) => status_report(record),
                    None => format!("No active task. {HELP_TEXT}"),
                }])
            }
            "done" => {
                return match task {
                    Some(record) => self.trigger_done(record, now),
                    None => Ok(vec![format!("Nothing in progress. {HELP_TEXT}")]),
                }
            }
            _ => {}
        }

        let Some(record) = task else {
            return Ok(vec![HELP_TEXT.to_string()]);
        };

        match record.state {
            TaskState::Configuring => self.apply_configuration(record, &text, now),
            TaskState::Created | TaskState::CollectingInput
                if record.workflow.collects_text() && event.event_type == EventKind::Text =>
            {
                self.append_markdown_fragment(record, &text, now)
            }
            _ => Ok(vec![format!(
                "I didn't understand that here. {}",
                record.workflow.instructions()
            )]),
        }
    }

    fn route_file(
        &self,
        event: &InboundEvent,
        task: Option<TaskRecord>,
        now: i64,
    ) -> Result<Vec<String>, RouterError> {
        let Some(record) = task else {
            return Ok(vec![format!("Start a workflow first. {HELP_TEXT}")]);
        };

        if !matches!(
            record.state,
            TaskState::Created | TaskState::CollectingInput
        ) {
            return Ok(vec![
                "Files can't be added at this point of the task.".to_string()
            ]);
        }

        let kind = record.workflow;
        let raw_name = event.file_name.clone().unwrap_or_default();
        if !kind.accepts_file(&raw_name) {
            return Ok(vec![ValidationError::unsupported_file(kind).to_string()]);
        }
        if let Some(max) = kind.max_files() {
            if record.files.len() >= max {
                return Ok(vec![ValidationError::TooManyFiles { max }.to_string()]);
            }
        }

        let staged = event.file_path.clone().unwrap_or_default();
        let bytes = match fs::read(&staged) {
            Ok(bytes) => bytes,
            Err(source) => {
                return Err(RouterError::StagedRead {
                    path: staged,
                    source,
                })
            }
        };

        let task_dir = self.task_dir(&record);
        let stored = match files::store_file(&task_dir, &raw_name, &bytes) {
            Ok(stored) => stored,
            Err(FileError::UnsafeName { .. }) => {
                return Ok(vec![
                    "That file name is not acceptable; rename the file and resend it.".to_string(),
                ]);
            }
            // Disk-level failure: the step fails and the task moves to
            // Failed, with best-effort cleanup.
            Err(err) => {
                append_router_log(
                    &self.state_root,
                    now,
                    "route.file_store_failed",
                    &format!("sender={} error={err}", record.sender_id),
                );
                return self.fail_task(record, now, "Could not store your file.".to_string());
            }
        };

        let page_count = if kind == WorkflowKind::Split {
            self.probe_page_count(&stored.path, &task_dir)
        } else {
            None
        };

        let handle_id = event.message_id.clone();
        let updated = self.store.with_task(&record.sender_id, |task| {
            if task.task_id != record.task_id {
                return Err(StoreError::NotFound {
                    sender_id: record.sender_id.clone(),
                });
            }
            if task.state == TaskState::Created {
                task.transition(TaskState::CollectingInput, now, None)?;
            }
            if !task.files.iter().any(|f| f.handle_id == handle_id) {
                task.files.push(FileHandle {
                    handle_id: handle_id.clone(),
                    name: stored.name.clone(),
                    path: stored.path.clone(),
                    size: stored.size,
                    order: task.next_file_order(),
                });
            }
            if let Some(pages) = page_count {
                task.metadata
                    .insert(meta::PAGE_COUNT.to_string(), Value::from(pages));
            }
            // Reaching the expected input count advances straight to
            // parameter collection; Split takes exactly one document.
            if task.workflow.needs_configuring()
                && task.workflow.max_files() == Some(task.files.len())
            {
                task.transition(TaskState::Configuring, now, None)?;
            }
            task.updated_at = now;
            Ok(())
        })?;

        append_router_log(
            &self.state_root,
            now,
            "route.file_stored",
            &format!(
                "sender={} task={} file={} order={}",
                updated.sender_id,
                updated.task_id,
                stored.name,
                updated.files.len()
            ),
        );

        if updated.state == TaskState::Configuring {
            return Ok(vec![configuring_prompt(&updated)]);
        }
        Ok(vec![intake_reply(&updated, &stored.name)])
    }

    fn start_task(
        &self,
        sender_id: &str,
        kind: WorkflowKind,
        now: i64,
    ) -> Result<Vec<String>, RouterError> {
        let task_id = match generate_task_id(now) {
            Ok(task_id) => task_id,
            Err(reason) => {
                append_router_log(&self.state_root, now, "route.task_id_failed", &reason);
                return Ok(vec![format!(
                    "Sorry, failed to start the {kind} process."
                )]);
            }
        };

        if let Err(err) = files::allocate_task_dir(&self.state_root, sender_id, &task_id) {
            append_router_log(
                &self.state_root,
                now,
                "route.task_dir_failed",
                &format!("sender={sender_id} error={err}"),
            );
            return Ok(vec![format!("Sorry, failed to start the {kind} process.")]);
        }

        let record = TaskRecord::new(
            &task_id,
            sender_id,
            kind,
            now,
            self.settings.tasks.ttl_seconds,
        );
        match self.store.insert(&record) {
            Ok(()) => {}
            Err(StoreError::ActiveTaskExists { .. }) => {
                // Lost a race with another event for this sender; leave the
                // winner's task alone and reclaim the directory we made.
                let _ = files::cleanup_task_dir(&self.task_dir(&record));
                return Ok(vec![ACTIVE_TASK_GUIDANCE.to_string()]);
            }
            Err(err) => return Err(err.into()),
        }

        append_router_log(
            &self.state_root,
            now,
            "route.task_started",
            &format!("sender={sender_id} task={task_id} workflow={kind}"),
        );
        Ok(vec![kind.instructions().to_string()])
    }

    fn cancel_task(&self, record: TaskRecord, now: i64) -> Result<Vec<String>, RouterError> {
        let was_processing = record.state == TaskState::Processing;
        let updated = match self.store.with_task(&record.sender_id, |task| {
            task.transition(TaskState::Cancelled, now, Some("cancelled by user".to_string()))
        }) {
            Ok(updated) => updated,
            Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound { .. }) => {
                return Ok(vec![START_NEW_GUIDANCE.to_string()]);
            }
            Err(err) => return Err(err.into()),
        };

        append_router_log(
            &self.state_root,
            now,
            "route.cancelled",
            &format!("sender={} task={}", updated.sender_id, updated.task_id),
        );

        if was_processing {
            // The running worker observes Cancelled at its next check, kills
            // any in-flight subprocess, and reclaims the task itself.
            Ok(vec![
                "Cancelling the running task; in-flight work is being stopped.".to_string(),
            ])
        } else {
            executor::reclaim_task(&self.state_root, &self.store, &updated);
            Ok(vec!["Task cancelled.".to_string()])
        }
    }

    fn trigger_done(&self, record: TaskRecord, now: i64) -> Result<Vec<String>, RouterError> {
        match record.state {
            TaskState::Created | TaskState::CollectingInput => {}
            TaskState::Configuring => {
                return if record.workflow == WorkflowKind::Compress {
                    // 'done' without an explicit level applies the default.
                    self.apply_configuration(record, "medium", now)
                } else {
                    Ok(vec![ValidationError::EmptyRanges.to_string()])
                };
            }
            TaskState::Processing => {
                return Ok(vec!["Still processing; send 'status' for progress.".to_string()])
            }
            _ => return Ok(vec![START_NEW_GUIDANCE.to_string()]),
        }

        let have = if record.workflow.collects_text() {
            markdown_fragments(&record).len()
        } else {
            record.files.len()
        };
        let needed = record.workflow.min_inputs();
        if have < needed {
            return Ok(vec![ValidationError::NotEnoughInputs { needed, have }.to_string()]);
        }

        if record.workflow.needs_configuring() {
            let updated = self.store.with_task(&record.sender_id, |task| {
                if task.state == TaskState::Created {
                    task.transition(TaskState::CollectingInput, now, None)?;
                }
                task.transition(TaskState::Configuring, now, None)
            })?;
            return Ok(vec![configuring_prompt(&updated)]);
        }

        self.start_processing(record, now)
    }

    /// Parameter input while Configuring: page ranges for Split, a level for
    /// Compress. Bad parameters are reported and leave the state unchanged.
    fn apply_configuration(
        &self,
        record: TaskRecord,
        input: &str,
        now: i64,
    ) -> Result<Vec<String>, RouterError> {
        match record.workflow {
            WorkflowKind::Split => {
                let max_pages = record
                    .metadata
                    .get(meta::PAGE_COUNT)
                    .and_then(Value::as_u64)
                    .map(|v| v as u32);
                let ranges = match workflow::parse_page_ranges(input, max_pages) {
                    Ok(ranges) => ranges,
                    Err(err) => return Ok(vec![err.to_string()]),
                };
                let encoded: Vec<Value> = ranges
                    .iter()
                    .map(|(start, end)| Value::from(vec![*start, *end]))
                    .collect();
                let updated = self.store.with_task(&record.sender_id, |task| {
                    task.metadata
                        .insert(meta::RANGES.to_string(), Value::from(encoded.clone()));
                    Ok(())
                })?;
                self.start_processing(updated, now)
            }
            WorkflowKind::Compress => {
                let level = match workflow::CompressionLevel::parse(input) {
                    Ok(level) => level,
                    Err(err) => return Ok(vec![err.to_string()]),
                };
                let updated = self.store.with_task(&record.sender_id, |task| {
                    task.metadata.insert(
                        meta::COMPRESSION_LEVEL.to_string(),
                        Value::from(level.as_str()),
                    );
                    Ok(())
                })?;
                self.start_processing(updated, now)
            }
            _ => Ok(vec![format!(
                "I didn't understand that here. {}",
                record.workflow.instructions()
            )]),
        }
    }

    fn append_markdown_fragment(
        &self,
        record: TaskRecord,
        text: &str,
        now: i64,
    ) -> Result<Vec<String>, RouterError> {
        if text.trim().is_empty() {
            return Ok(vec![
                "Send markdown text, or 'done' when you've sent everything.".to_string(),
            ]);
        }
        let fragment = text.to_string();
        let updated = self.store.with_task(&record.sender_id, |task| {
            if task.state == TaskState::Created {
                task.transition(TaskState::CollectingInput, now, None)?;
            }
            let fragments = task
                .metadata
                .entry(meta::MARKDOWN_FRAGMENTS.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = fragments {
                items.push(Value::from(fragment.clone()));
            }
            Ok(())
        })?;
        let count = markdown_fragments(&updated).len();
        Ok(vec![format!(
            "Markdown received ({count} message(s) so far). Send more or 'done' to convert."
        )])
    }

    fn start_processing(
        &self,
        record: TaskRecord,
        now: i64,
    ) -> Result<Vec<String>, RouterError> {
        let deadline = now.saturating_add(self.settings.tasks.processing_timeout_seconds);
        let updated = self.store.with_task(&record.sender_id, |task| {
            if task.state == TaskState::Created {
                task.transition(TaskState::CollectingInput, now, None)?;
            }
            task.transition(TaskState::Processing, now, None)?;
            task.processing_deadline = Some(deadline);
            Ok(())
        })?;

        let job = ProcessingJob {
            sender_id: updated.sender_id.clone(),
            task_id: updated.task_id.clone(),
            enqueued_at: now,
        };
        let paths = QueuePaths::from_state_root(&self.state_root);
        match queue::enqueue_job(&paths, &job) {
            Ok(_) => {
                append_router_log(
                    &self.state_root,
                    now,
                    "route.job_enqueued",
                    &format!("sender={} task={}", job.sender_id, job.task_id),
                );
            }
            Err(err) => {
                // Queue backend unreachable: run the step in-process with the
                // same semantics; only throughput degrades.
                append_router_log(
                    &self.state_root,
                    now,
                    "route.job_fallback_sync",
                    &format!("sender={} task={} error={err}", job.sender_id, job.task_id),
                );
                if let Err(reason) =
                    executor::execute_job(&self.state_root, &self.settings, &self.store, &job)
                {
                    append_router_log(
                        &self.state_root,
                        now,
                        "route.job_fallback_failed",
                        &format!("task={} error={reason}", job.task_id),
                    );
                }
            }
        }

        Ok(vec![
            "Processing started... You'll receive the result here.".to_string(),
        ])
    }

    fn fail_task(
        &self,
        record: TaskRecord,
        now: i64,
        cause: String,
    ) -> Result<Vec<String>, RouterError> {
        let updated = self.store.with_task(&record.sender_id, |task| {
            task.transition(TaskState::Failed, now, Some(cause.clone()))
        })?;
        executor::reclaim_task(&self.state_root, &self.store, &updated);
        Ok(vec![format!("{cause} Start a new workflow to retry.")])
    }

    fn probe_page_count(&self, pdf_path: &Path, task_dir: &Path) -> Option<u64> {
        let spec = &self.settings.tools.pdfinfo;
        let invocation = ToolInvocation::new(
            spec.binary.clone(),
            vec![pdf_path.display().to_string()],
            task_dir,
            Duration::from_secs(spec.timeout_seconds),
        );
        let outcome = self.gateway.invoke(&invocation).ok()?;
        outcome.stdout.lines().find_map(|line| {
            let rest = line.strip_prefix("Pages:")?;
            rest.trim().parse::<u64>().ok()
        })
    }

    fn task_dir(&self, record: &TaskRecord) -> PathBuf {
        files::sender_files_dir(&self.state_root, &record.sender_id).join(&record.task_id)
    }
}

fn markdown_fragments(record: &TaskRecord) -> Vec<String> {
    record
        .metadata
        .get(meta::MARKDOWN_FRAGMENTS)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn intake_reply(record: &TaskRecord, stored_name: &str) -> String {
    let count = record.files.len();
    match record.workflow {
        WorkflowKind::Merge => {
            format!("PDF {count} received ({stored_name}). Send more or 'done' to merge.")
        }
        WorkflowKind::Split => {
            "PDF received. Send 'done', then the page ranges (e.g. '1-10, 15, 20-25').".to_string()
        }
        WorkflowKind::Compress => {
            format!("PDF {count} received. Send more, or 'done' to pick a compression level.")
        }
        WorkflowKind::Scan => {
            format!("Image {count} received. Send more or 'done' to scan.")
        }
        _ => format!("File {count} received ({stored_name}). Send more or 'done' to convert."),
    }
}

fn configuring_prompt(record: &TaskRecord) -> String {
    match record.workflow {
        WorkflowKind::Split => {
            let pages = record
                .metadata
                .get(meta::PAGE_COUNT)
                .and_then(Value::as_u64);
            match pages {
                Some(pages) => format!(
                    "The document has {pages} page(s). Send the page ranges to extract (e.g. '1-10, 15, 20-25')."
                ),
                None => "Send the page ranges to extract (e.g. '1-10, 15, 20-25').".to_string(),
            }
        }
        WorkflowKind::Compress => {
            "Choose a compression level: low (1), medium (2), high (3), max (4), or 'auto'. \
             Send 'done' for the default (medium)."
                .to_string()
        }
        _ => "Send the remaining parameters.".to_string(),
    }
}

fn status_report(record: &TaskRecord) -> String {
    let started = chrono::DateTime::from_timestamp(record.created_at, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| record.created_at.to_string());
    format!(
        "Task {}: workflow={} state={} files={} started={started}",
        record.task_id,
        record.workflow,
        record.state,
        record.files.len()
    )
}
