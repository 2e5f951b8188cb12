use crate::config::{RetrySettings, Settings, ToolSpec};
use crate::files::{cleanup_task_dir, deliver_outputs, sender_files_dir};
use crate::queue::{self, OutboundMessage, ProcessingJob, QueuePaths};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::append_runtime_log;
use crate::shared::now_secs;
use crate::store::{StoreError, TaskRecord, TaskStore};
use crate::tools::{ToolError, ToolGateway, ToolInvocation, ToolOutcome};
use crate::workflow::{self, meta, CompressionLevel, TaskState, WorkflowKind, SCAN_VERSIONS};
use serde_json::Value;
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

struct PipelineOutput {
    outputs: Vec<PathBuf>,
    summary: String,
}

pub fn task_dir(state_root: &Path, record: &TaskRecord) -> PathBuf {
    sender_files_dir(state_root, &record.sender_id).join(&record.task_id)
}

/// Runs one task's processing step to completion: tool pipeline with bounded
/// retries, cooperative cancellation, result delivery, and the
/// directory-then-record teardown. Invoked from queue workers and, as the
/// synchronous fallback, from the router itself.
pub fn execute_job(
    state_root: &Path,
    settings: &Settings,
    store: &TaskStore,
    job: &ProcessingJob,
) -> Result<(), String> {
    let record = match store.load(&job.sender_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            append_runtime_log(
                state_root,
                "warn",
                "executor.stale_job",
                &format!("task={} has no record", job.task_id),
            );
            return Ok(());
        }
        Err(err) => return Err(err.to_string()),
    };
    if record.task_id != job.task_id || record.state != TaskState::Processing {
        append_runtime_log(
            state_root,
            "warn",
            "executor.stale_job",
            &format!(
                "task={} state={} does not match job",
                record.task_id, record.state
            ),
        );
        return Ok(());
    }

    let gateway = ToolGateway::new(state_root, settings.tools.capture_limit_bytes);
    let probe = CancelProbe::new(store, &record.sender_id, &record.task_id);
    let attempts = Cell::new(0u32);
    let dir = task_dir(state_root, &record);

    if probe.is_cancelled() {
        reclaim_task(state_root, store, &record);
        return Ok(());
    }

    let result = run_pipeline(settings, &gateway, &record, &dir, &probe, &attempts);

    match result {
        Err(ToolError::Cancelled { .. }) => {
            append_runtime_log(
                state_root,
                "info",
                "executor.cancelled",
                &format!("task={}", record.task_id),
            );
            reclaim_task(state_root, store, &record);
            Ok(())
        }
        Ok(output) => complete_task(state_root, store, &record, output, attempts.get()),
        Err(err) => {
            append_runtime_log(
                state_root,
                "error",
                "executor.step_failed",
                &format!("task={} error={err}", record.task_id),
            );
            fail_task(state_root, store, &record, err.user_cause(), attempts.get())
        }
    }
}

fn complete_task(
    state_root: &Path,
    store: &TaskStore,
    record: &TaskRecord,
    output: PipelineOutput,
    attempts: u32,
) -> Result<(), String> {
    let now = now_secs();
    let (delivered, failures) = deliver_outputs(state_root, &record.sender_id, &output.outputs);
    for failure in &failures {
        append_runtime_log(
            state_root,
            "warn",
            "executor.delivery_failed",
            &format!("task={} path={failure}", record.task_id),
        );
    }
    if delivered.is_empty() && !output.outputs.is_empty() {
        return fail_task(
            state_root,
            store,
            record,
            "The result could not be delivered.".to_string(),
            attempts,
        );
    }

    let transitioned = store.with_task(&record.sender_id, |task| {
        if task.task_id != record.task_id {
            return Err(StoreError::NotFound {
                sender_id: record.sender_id.clone(),
            });
        }
        task.attempt = attempts;
        task.transition(TaskState::Completed, now, None)
    });
    match transitioned {
        Ok(_) => {}
        // Cancelled (or reclaimed) while the last step ran: never deliver a
        // completed result after a cancel.
        Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound { .. }) => {
            reclaim_task(state_root, store, record);
            return Ok(());
        }
        Err(err) => return Err(err.to_string()),
    }

    send_outbound(
        state_root,
        record,
        output.summary,
        delivered.iter().map(|p| p.display().to_string()).collect(),
    );
    reclaim_task(state_root, store, record);
    append_runtime_log(
        state_root,
        "info",
        "executor.completed",
        &format!("task={} outputs={}", record.task_id, delivered.len()),
    );
    Ok(())
}

fn fail_task(
    state_root: &Path,
    store: &TaskStore,
    record: &TaskRecord,
    cause: String,
    attempts: u32,
) -> Result<(), String> {
    let now = now_secs();
    let transitioned = store.with_task(&record.sender_id, |task| {
        if task.task_id != record.task_id {
            return Err(StoreError::NotFound {
                sender_id: record.sender_id.clone(),
            });
        }
        task.attempt = attempts;
        task.transition(TaskState::Failed, now, Some(cause.clone()))
    });
    match transitioned {
        Ok(_) => {
            send_outbound(
                state_root,
                record,
                format!("Processing failed: {cause} Start a new workflow to retry."),
                Vec::new(),
            );
        }
        Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound { .. }) => {}
        Err(err) => return Err(err.to_string()),
    }
    reclaim_task(state_root, store, record);
    Ok(())
}

/// Best-effort teardown: remove the task directory entry by entry, then, and
/// only then, the store record. The record outlives the directory so a
/// half-reclaimed task is always rediscoverable.
pub fn reclaim_task(state_root: &Path, store: &TaskStore, record: &TaskRecord) {
    let dir = task_dir(state_root, record);
    let report = cleanup_task_dir(&dir);
    for failure in &report.failures {
        append_runtime_log(
            state_root,
            "warn",
            "executor.cleanup_failure",
            &format!("task={} path={failure}", record.task_id),
        );
    }
    match store.delete(&record.sender_id) {
        Ok(_) => {}
        Err(err) => append_runtime_log(
            state_root,
            "error",
            "executor.record_delete_failed",
            &format!("task={} error={err}", record.task_id),
        ),
    }
}

fn send_outbound(
    state_root: &Path,
    record: &TaskRecord,
    text: String,
    attachment_paths: Vec<String>,
) {
    let paths = QueuePaths::from_state_root(state_root);
    let message = OutboundMessage {
        sender_id: record.sender_id.clone(),
        message_id: record.task_id.clone(),
        text: queue::prepare_outbound_text(&text),
        files: attachment_paths,
        timestamp: now_secs(),
    };
    if let Err(err) = queue::write_outbound(&paths, &message) {
        append_runtime_log(
            state_root,
            "error",
            "executor.outbound_failed",
            &format!("task={} error={err}", record.task_id),
        );
    }
}

/// Re-reads the task state from the store, throttled so the spawn-wait loop
/// does not hammer the database. A replaced or vanished record also stops
/// the pipeline.
struct CancelProbe<'a> {
    store: &'a TaskStore,
    sender_id: &'a str,
    task_id: &'a str,
    last_check: Cell<Option<Instant>>,
    cancelled: Cell<bool>,
}

impl<'a> CancelProbe<'a> {
    fn new(store: &'a TaskStore, sender_id: &'a str, task_id: &'a str) -> Self {
        Self {
            store,
            sender_id,
            task_id,
            last_check: Cell::new(None),
            cancelled: Cell::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        if self.cancelled.get() {
            return true;
        }
        let due = self
            .last_check
            .get()
            .map(|at| at.elapsed() >= Duration::from_millis(500))
            .unwrap_or(true);
        if !due {
            return false;
        }
        self.last_check.set(Some(Instant::now()));
        match self.store.load(self.sender_id) {
            Ok(Some(task)) if task.task_id == self.task_id => {
                if task.state == TaskState::Cancelled {
                    self.cancelled.set(true);
                }
                self.cancelled.get()
            }
            Ok(_) => {
                self.cancelled.set(true);
                true
            }
            Err(_) => false,
        }
    }
}

fn run_pipeline(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    match record.workflow {
        WorkflowKind::Merge => run_merge(settings, gateway, record, task_dir, probe, attempts),
        WorkflowKind::Split => run_split(settings, gateway, record, task_dir, probe, attempts),
        WorkflowKind::Scan => run_scan(settings, gateway, record, task_dir, probe, attempts),
        WorkflowKind::ConvertWord
        | WorkflowKind::ConvertPowerPoint
        | WorkflowKind::ConvertExcel => {
            run_convert(settings, gateway, record, task_dir, probe, attempts)
        }
        WorkflowKind::Compress => run_compress(settings, gateway, record, task_dir, probe, attempts),
        WorkflowKind::MarkdownToPdf => {
            run_markdown(settings, gateway, record, task_dir, probe, attempts)
        }
    }
}

fn ordered_inputs(record: &TaskRecord) -> Vec<PathBuf> {
    let mut files: Vec<_> = record.files.iter().collect();
    files.sort_by_key(|f| f.order);
    files.iter().map(|f| f.path.clone()).collect()
}

fn cancelled_step(command: &str) -> ToolError {
    ToolError::Cancelled {
        command: command.to_string(),
    }
}

fn internal_error(command: &str, detail: String) -> ToolError {
    ToolError::Io {
        command: command.to_string(),
        source: std::io::Error::other(detail),
    }
}

/// One tool step under the retry policy: transient classifications are
/// retried with a fixed backoff up to the configured attempt budget;
/// permanent ones fail immediately.
fn invoke_with_retry(
    gateway: &ToolGateway,
    invocation: &ToolInvocation,
    retry: &RetrySettings,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<ToolOutcome, ToolError> {
    let mut attempt = 0u32;
    loop {
        if probe.is_cancelled() {
            return Err(cancelled_step(&invocation.command_form()));
        }
        attempt += 1;
        attempts.set(attempts.get() + 1);
        match gateway.invoke_with_cancel(invocation, || probe.is_cancelled()) {
            Ok(outcome) => return Ok(outcome),
            Err(err @ ToolError::Cancelled { .. }) => return Err(err),
            Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                thread::sleep(Duration::from_secs(retry.backoff_seconds));
            }
            Err(err) => return Err(err),
        }
    }
}

fn require_output(path: &Path, command: &str) -> Result<(), ToolError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(internal_error(
            command,
            format!("expected output {} was not created", path.display()),
        ))
    }
}

fn gs_invocation(spec: &ToolSpec, task_dir: &Path, args: Vec<String>) -> ToolInvocation {
    ToolInvocation::new(
        spec.binary.clone(),
        args,
        task_dir,
        Duration::from_secs(spec.timeout_seconds),
    )
}

fn run_merge(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    let output = task_dir.join("Merged.pdf");
    let mut args = vec![
        "-sDEVICE=pdfwrite".to_string(),
        "-dNOPAUSE".to_string(),
        "-dBATCH".to_string(),
        "-dSAFER".to_string(),
        format!("-sOutputFile={}", output.display()),
    ];
    args.extend(
        ordered_inputs(record)
            .iter()
            .map(|p| p.display().to_string()),
    );

    let invocation = gs_invocation(&settings.tools.ghostscript, task_dir, args);
    invoke_with_retry(gateway, &invocation, &settings.retry, probe, attempts)?;
    require_output(&output, &invocation.command_form())?;

    Ok(PipelineOutput {
        outputs: vec![output],
        summary: format!(
            "Here is your merged PDF ({} documents combined).",
            record.files.len()
        ),
    })
}

fn run_split(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    let source = ordered_inputs(record)
        .first()
        .cloned()
        .ok_or_else(|| internal_error("split", "split task has no source file".to_string()))?;
    let stem = source
        .file_stem()
        .and_then(|v| v.to_str())
        .unwrap_or("document")
        .to_string();

    let ranges: Vec<(u32, u32)> = record
        .metadata
        .get(meta::RANGES)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|pair| {
                    let pair = pair.as_array()?;
                    Some((pair.first()?.as_u64()? as u32, pair.get(1)?.as_u64()? as u32))
                })
                .collect()
        })
        .unwrap_or_default();
    let total_pages = record
        .metadata
        .get(meta::PAGE_COUNT)
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    let parts = workflow::split_definitions(&ranges, total_pages);
    if parts.is_empty() {
        return Err(internal_error(
            "split",
            "no page ranges were configured".to_string(),
        ));
    }

    let mut outputs = Vec::new();
    let mut requested_count = 0usize;
    for part in &parts {
        if probe.is_cancelled() {
            return Err(cancelled_step("split"));
        }
        let output = task_dir.join(format!("{stem}_pages_{}-{}.pdf", part.start, part.end));
        let invocation = gs_invocation(
            &settings.tools.ghostscript,
            task_dir,
            vec![
                "-sDEVICE=pdfwrite".to_string(),
                "-dNOPAUSE".to_string(),
                "-dBATCH".to_string(),
                "-dSAFER".to_string(),
                format!("-dFirstPage={}", part.start),
                format!("-dLastPage={}", part.end),
                format!("-sOutputFile={}", output.display()),
                source.display().to_string(),
            ],
        );
        invoke_with_retry(gateway, &invocation, &settings.retry, probe, attempts)?;
        require_output(&output, &invocation.command_form())?;
        if part.requested {
            requested_count += 1;
        }
        outputs.push(output);
    }

    Ok(PipelineOutput {
        summary: format!(
            "Split complete: {} part(s), {requested_count} requested.",
            outputs.len()
        ),
        outputs,
    })
}

fn run_scan(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    let inputs = ordered_inputs(record);

    for image in &inputs {
        if probe.is_cancelled() {
            return Err(cancelled_step("scan"));
        }
        let spec = &settings.tools.scanner;
        let invocation = ToolInvocation::new(
            spec.binary.clone(),
            vec![
                "--image".to_string(),
                image.display().to_string(),
                "--output".to_string(),
                task_dir.display().to_string(),
            ],
            task_dir,
            Duration::from_secs(spec.timeout_seconds),
        );
        invoke_with_retry(gateway, &invocation, &settings.retry, probe, attempts)?;
    }

    let mut outputs = Vec::new();
    for (version, suffix) in SCAN_VERSIONS {
        let pages: Vec<PathBuf> = inputs
            .iter()
            .filter_map(|image| {
                if suffix.is_empty() {
                    return Some(image.clone());
                }
                let stem = image.file_stem()?.to_str()?;
                let candidate = task_dir.join(format!("{stem}{suffix}.jpg"));
                candidate.is_file().then_some(candidate)
            })
            .collect();
        if pages.is_empty() {
            continue;
        }
        if probe.is_cancelled() {
            return Err(cancelled_step("scan"));
        }

        let output = task_dir.join(format!("Scanned_Document_{version}.pdf"));
        let spec = &settings.tools.img2pdf;
        let mut args: Vec<String> = pages.iter().map(|p| p.display().to_string()).collect();
        args.push("-o".to_string());
        args.push(output.display().to_string());
        let invocation = ToolInvocation::new(
            spec.binary.clone(),
            args,
            task_dir,
            Duration::from_secs(spec.timeout_seconds),
        );
        invoke_with_retry(gateway, &invocation, &settings.retry, probe, attempts)?;
        require_output(&output, &invocation.command_form())?;
        outputs.push(output);
    }

    if outputs.is_empty() {
        return Err(internal_error(
            "scan",
            "no scan versions were produced".to_string(),
        ));
    }

    Ok(PipelineOutput {
        summary: format!(
            "Scan complete: {} version(s) of {} page(s).",
            outputs.len(),
            inputs.len()
        ),
        outputs,
    })
}

fn run_convert(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    let filter = match record.workflow {
        WorkflowKind::ConvertWord => "pdf:writer_pdf_Export",
        WorkflowKind::ConvertPowerPoint => "pdf:impress_pdf_Export",
        _ => "pdf:calc_pdf_Export",
    };

    let mut outputs = Vec::new();
    for input in ordered_inputs(record) {
        if probe.is_cancelled() {
            return Err(cancelled_step("convert"));
        }
        let spec = &settings.tools.libreoffice;
        let mut invocation = ToolInvocation::new(
            spec.binary.clone(),
            vec![
                "--headless".to_string(),
                "--norestore".to_string(),
                "--invisible".to_string(),
                "--nologo".to_string(),
                "--nolockcheck".to_string(),
                "--nodefault".to_string(),
                "--nofirststartwizard".to_string(),
                "--convert-to".to_string(),
                filter.to_string(),
                "--outdir".to_string(),
                task_dir.display().to_string(),
                input.display().to_string(),
            ],
            task_dir,
            Duration::from_secs(spec.timeout_seconds),
        );
        // Headless environment; a private HOME keeps profile locks inside
        // the task directory.
        invocation.env = vec![
            ("HOME".to_string(), task_dir.display().to_string()),
            ("SAL_USE_VCLPLUGIN".to_string(), "svp".to_string()),
            ("DISPLAY".to_string(), String::new()),
            ("QT_QPA_PLATFORM".to_string(), "offscreen".to_string()),
            ("NO_AT_BRIDGE".to_string(), "1".to_string()),
            ("LC_ALL".to_string(), "C.UTF-8".to_string()),
        ];
        invoke_with_retry(gateway, &invocation, &settings.retry, probe, attempts)?;

        let stem = input
            .file_stem()
            .and_then(|v| v.to_str())
            .unwrap_or("document");
        let output = task_dir.join(format!("{stem}.pdf"));
        require_output(&output, &invocation.command_form())?;
        outputs.push(output);
    }

    Ok(PipelineOutput {
        summary: format!("Converted {} document(s) to PDF.", outputs.len()),
        outputs,
    })
}

fn run_compress(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    let level = record
        .metadata
        .get(meta::COMPRESSION_LEVEL)
        .and_then(Value::as_str)
        .and_then(|raw| CompressionLevel::parse(raw).ok())
        .unwrap_or(CompressionLevel::Medium);
    let preset = level.preset();

    let mut outputs = Vec::new();
    let mut notes = Vec::new();
    for input in ordered_inputs(record) {
        if probe.is_cancelled() {
            return Err(cancelled_step("compress"));
        }
        let stem = input
            .file_stem()
            .and_then(|v| v.to_str())
            .unwrap_or("document");
        let output = task_dir.join(format!("{stem}_compressed.pdf"));
        let invocation = gs_invocation(
            &settings.tools.ghostscript,
            task_dir,
            vec![
                "-sDEVICE=pdfwrite".to_string(),
                "-dCompatibilityLevel=1.4".to_string(),
                format!("-dPDFSETTINGS={}", preset.pdfsettings),
                format!("-dColorImageResolution={}", preset.dpi),
                format!("-dGrayImageResolution={}", preset.dpi),
                format!("-dMonoImageResolution={}", preset.dpi),
                format!("-dJPEGQ={}", preset.jpeg_quality),
                "-dNOPAUSE".to_string(),
                "-dQUIET".to_string(),
                "-dBATCH".to_string(),
                format!("-sOutputFile={}", output.display()),
                input.display().to_string(),
            ],
        );
        invoke_with_retry(gateway, &invocation, &settings.retry, probe, attempts)?;
        require_output(&output, &invocation.command_form())?;

        let original_size = fs::metadata(&input).map(|m| m.len()).unwrap_or(0);
        let compressed_size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if original_size > 0 && compressed_size >= original_size {
            // Compression made it bigger; deliver the original bytes under
            // the compressed name.
            if let Err(source) = fs::copy(&input, &output) {
                return Err(ToolError::Io {
                    command: invocation.command_form(),
                    source,
                });
            }
            notes.push(format!("{stem}: no size reduction, original kept"));
        } else if original_size > 0 {
            let reduction = (1.0 - compressed_size as f64 / original_size as f64) * 100.0;
            notes.push(format!(
                "{stem}: {reduction:.1}% reduction ({:.1} KB -> {:.1} KB)",
                original_size as f64 / 1024.0,
                compressed_size as f64 / 1024.0
            ));
        }
        outputs.push(output);
    }

    Ok(PipelineOutput {
        summary: format!(
            "Compression ({}) finished.\n{}",
            level.as_str(),
            notes.join("\n")
        ),
        outputs,
    })
}

fn run_markdown(
    settings: &Settings,
    gateway: &ToolGateway,
    record: &TaskRecord,
    task_dir: &Path,
    probe: &CancelProbe<'_>,
    attempts: &Cell<u32>,
) -> Result<PipelineOutput, ToolError> {
    let fragments: Vec<String> = record
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
        .unwrap_or_default();
    if fragments.is_empty() {
        return Err(internal_error(
            "markdown",
            "no markdown content collected".to_string(),
        ));
    }

    let md_path = task_dir.join("document.md");
    let combined = fragments.join("\n\n");
    atomic_write_file(&md_path, combined.as_bytes()).map_err(|source| ToolError::Io {
        command: "markdown".to_string(),
        source,
    })?;
    let output = task_dir.join("document.pdf");

    // Every converter in the chain leaves `document.pdf` next to the source:
    // pandoc and md2pdf take the output path explicitly, md-to-pdf derives it
    // from the input stem.
    let invocations: Vec<ToolInvocation> = settings
        .tools
        .markdown_chain
        .iter()
        .map(|spec| {
            let base = Path::new(&spec.binary)
                .file_name()
                .and_then(|v| v.to_str())
                .unwrap_or(spec.binary.as_str());
            let args = match base {
                "pandoc" => vec![
                    md_path.display().to_string(),
                    "-o".to_string(),
                    output.display().to_string(),
                ],
                "md2pdf" => vec![md_path.display().to_string(), output.display().to_string()],
                _ => vec![md_path.display().to_string()],
            };
            ToolInvocation::new(
                spec.binary.clone(),
                args,
                task_dir,
                Duration::from_secs(spec.timeout_seconds),
            )
        })
        .collect();

    attempts.set(attempts.get() + 1);
    gateway.run_chain(&invocations, || probe.is_cancelled())?;
    require_output(&output, "markdown chain")?;

    Ok(PipelineOutput {
        outputs: vec![output],
        summary: "Here is your PDF generated from markdown text.".to_string(),
    })
}
