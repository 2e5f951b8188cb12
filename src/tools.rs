use crate::shared::logging::append_tools_log;
use crate::shared::now_secs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn new(
        executable: impl Into<String>,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            executable: executable.into(),
            args,
            working_dir: working_dir.into(),
            timeout,
            env: Vec::new(),
        }
    }

    pub fn command_form(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub command_form: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UnsupportedFormat,
    CorruptInput,
    PermissionDenied,
    ResourceLimit,
    Transient,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("required tool `{executable}` was not found")]
    NotFound { executable: String },
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("`{command}` failed (exit code {exit_code}): {}", .classified.message)]
    Execution {
        command: String,
        exit_code: i32,
        classified: ClassifiedFailure,
        stderr: String,
    },
    #[error("`{command}` was terminated by a signal")]
    Crash { command: String },
    #[error("`{command}` aborted: task was cancelled")]
    Cancelled { command: String },
    #[error("all {attempts} conversion attempts failed: {summary}")]
    ChainExhausted { attempts: usize, summary: String },
    #[error("io error running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Transient errors are worth retrying with the same input; everything
    /// else fails the step immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ToolError::Timeout { .. } | ToolError::Crash { .. } => true,
            ToolError::Execution { classified, .. } => classified.kind == FailureKind::Transient,
            _ => false,
        }
    }

    /// The single human-readable cause surfaced to the user on a terminal
    /// failure. Classification detail stays in the logs.
    pub fn user_cause(&self) -> String {
        match self {
            ToolError::NotFound { .. } => {
                "A required processing tool is not installed on this server.".to_string()
            }
            ToolError::Timeout { .. } => "Processing took too long and was stopped.".to_string(),
            ToolError::Execution { classified, .. } => classified.message.clone(),
            ToolError::Crash { .. } => "The processing tool stopped unexpectedly.".to_string(),
            ToolError::Cancelled { .. } => "The task was cancelled.".to_string(),
            ToolError::ChainExhausted { .. } => {
                "None of the available converters could process this document.".to_string()
            }
            ToolError::Io { .. } => "An internal error occurred while processing.".to_string(),
        }
    }
}

/// Known stderr fragments per tool, matched case-insensitively in order.
/// First hit wins.
fn error_patterns(tool: &str) -> &'static [(&'static str, FailureKind, &'static str)] {
    match tool {
        "gs" | "ghostscript" => &[
            ("invalidfont", FailureKind::CorruptInput, "Invalid font in document"),
            ("invalidfileaccess", FailureKind::PermissionDenied, "Permission denied or cannot access file"),
            ("limitcheck", FailureKind::ResourceLimit, "Memory limit exceeded during processing"),
            ("syntaxerror", FailureKind::CorruptInput, "Syntax error in PDF document"),
            ("pdffile", FailureKind::CorruptInput, "Invalid or corrupted PDF file"),
            ("typecheck", FailureKind::CorruptInput, "Type check error in PDF processing"),
            ("undefined", FailureKind::CorruptInput, "Undefined PDF element encountered"),
        ],
        "soffice" | "libreoffice" => &[
            ("source file could not be loaded", FailureKind::UnsupportedFormat, "Source file could not be loaded"),
            ("office process died", FailureKind::Transient, "LibreOffice process died unexpectedly"),
            ("unable to connect", FailureKind::Transient, "Unable to connect to LibreOffice service"),
            ("i/o error", FailureKind::CorruptInput, "I/O error occurred in LibreOffice"),
        ],
        "pandoc" | "md2pdf" | "md-to-pdf" => &[
            ("could not find data file", FailureKind::UnsupportedFormat, "Could not find required template or data file"),
            ("parse error", FailureKind::CorruptInput, "Parse error in markdown document"),
            ("not found", FailureKind::CorruptInput, "Required file not found"),
        ],
        "pdfinfo" => &[
            ("may not be a pdf file", FailureKind::UnsupportedFormat, "Input does not look like a PDF file"),
            ("syntax error", FailureKind::CorruptInput, "Syntax error in PDF document"),
            ("cannot open", FailureKind::CorruptInput, "Cannot open PDF file"),
        ],
        "qpdf" => &[
            ("invalid password", FailureKind::PermissionDenied, "PDF file requires a password"),
            ("syntax error", FailureKind::CorruptInput, "Syntax error in PDF document"),
            ("no such file", FailureKind::CorruptInput, "PDF file not found"),
        ],
        _ if tool.contains("scan") => &[
            ("no images found", FailureKind::CorruptInput, "No images found to process"),
            ("could not open image", FailureKind::CorruptInput, "Could not open image for scanning"),
            ("could not find any pages", FailureKind::CorruptInput, "No pages found in the document"),
        ],
        _ => &[],
    }
}

pub fn classify_failure(executable: &str, stderr: &str) -> ClassifiedFailure {
    let tool = Path::new(executable)
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or(executable)
        .to_lowercase();
    let lowered = stderr.to_lowercase();

    for (fragment, kind, message) in error_patterns(&tool) {
        if lowered.contains(fragment) {
            return ClassifiedFailure {
                kind: *kind,
                message: (*message).to_string(),
            };
        }
    }

    let message = stderr
        .lines()
        .find(|line| line.to_lowercase().contains("error"))
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "The processing tool reported an error.".to_string());
    ClassifiedFailure {
        kind: FailureKind::Unknown,
        message,
    }
}

/// Wraps every external-process call: existence check, timeout with whole
/// process-group termination, size-bounded capture, stderr classification,
/// fallback chains, and an invocation log line per call.
#[derive(Debug, Clone)]
pub struct ToolGateway {
    state_root: PathBuf,
    capture_limit: usize,
}

impl ToolGateway {
    pub fn new(state_root: impl Into<PathBuf>, capture_limit: usize) -> Self {
        Self {
            state_root: state_root.into(),
            capture_limit,
        }
    }

    pub fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        self.invoke_with_cancel(invocation, || false)
    }

    /// Like `invoke`, but polls `cancelled` while the child runs and kills
    /// the process group as soon as it reports true.
    pub fn invoke_with_cancel<F>(
        &self,
        invocation: &ToolInvocation,
        cancelled: F,
    ) -> Result<ToolOutcome, ToolError>
    where
        F: Fn() -> bool,
    {
        let command_form = invocation.command_form();
        let start = Instant::now();
        let result = self.run_child(invocation, &command_form, cancelled);
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(outcome) => append_tools_log(
                &self.state_root,
                now_secs(),
                "tool.ok",
                &format!(
                    "cmd=`{}` exit={:?} duration_ms={}",
                    outcome.command_form, outcome.exit_code, outcome.duration_ms
                ),
            ),
            Err(err) => append_tools_log(
                &self.state_root,
                now_secs(),
                "tool.error",
                &format!("cmd=`{command_form}` duration_ms={duration_ms} error={err}"),
            ),
        }
        result
    }

    fn run_child<F>(
        &self,
        invocation: &ToolInvocation,
        command_form: &str,
        cancelled: F,
    ) -> Result<ToolOutcome, ToolError>
    where
        F: Fn() -> bool,
    {
        let mut command = Command::new(&invocation.executable);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &invocation.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // The child leads its own process group so a timeout can take
            // down any grandchildren it spawned.
            command.process_group(0);
        }

        let io_error = |source: std::io::Error| ToolError::Io {
            command: command_form.to_string(),
            source,
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound {
                    executable: invocation.executable.clone(),
                })
            }
            Err(err) => return Err(io_error(err)),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("missing stderr pipe")))?;

        let stdout_reader = thread::spawn(move || read_all(stdout));
        let stderr_reader = thread::spawn(move || read_all(stderr));

        let start = Instant::now();
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if cancelled() {
                        kill_process_group(&mut child);
                        let _ = child.wait();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return Err(ToolError::Cancelled {
                            command: command_form.to_string(),
                        });
                    }
                    if start.elapsed() > invocation.timeout {
                        kill_process_group(&mut child);
                        let _ = child.wait();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return Err(ToolError::Timeout {
                            command: command_form.to_string(),
                            timeout_secs: invocation.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(io_error(err)),
            }
        };

        let stdout = truncate_capture(
            stdout_reader.join().unwrap_or_default(),
            self.capture_limit,
        );
        let stderr = truncate_capture(
            stderr_reader.join().unwrap_or_default(),
            self.capture_limit,
        );

        let outcome = ToolOutcome {
            command_form: command_form.to_string(),
            exit_code: exit_status.code(),
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        match exit_status.code() {
            Some(0) => Ok(outcome),
            Some(code) => Err(ToolError::Execution {
                command: command_form.to_string(),
                exit_code: code,
                classified: classify_failure(&invocation.executable, &outcome.stderr),
                stderr: outcome.stderr,
            }),
            None => Err(ToolError::Crash {
                command: command_form.to_string(),
            }),
        }
    }

    /// Tries each invocation in order and short-circuits on the first
    /// success. When every alternative fails the result aggregates each
    /// attempt's classified error.
    pub fn run_chain<F>(
        &self,
        invocations: &[ToolInvocation],
        cancelled: F,
    ) -> Result<ToolOutcome, ToolError>
    where
        F: Fn() -> bool,
    {
        let mut failures = Vec::new();
        for invocation in invocations {
            match self.invoke_with_cancel(invocation, &cancelled) {
                Ok(outcome) => return Ok(outcome),
                Err(err @ ToolError::Cancelled { .. }) => return Err(err),
                Err(err) => failures.push(format!("{}: {err}", invocation.executable)),
            }
        }
        Err(ToolError::ChainExhausted {
            attempts: failures.len(),
            summary: failures.join("; "),
        })
    }
}

fn read_all<R: Read>(mut reader: R) -> String {
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf);
    buf
}

fn truncate_capture(mut raw: String, limit: usize) -> String {
    if raw.len() <= limit {
        return raw;
    }
    let mut cut = limit;
    while cut > 0 && !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    raw.truncate(cut);
    raw.push_str("\n[output truncated]");
    raw
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let pid = child.id() as i32;
    // Negative pid targets the whole group; the direct kill is the fallback
    // when the group is already gone.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}
