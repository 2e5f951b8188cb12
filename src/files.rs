use crate::shared::fs_atomic::{atomic_write_file, canonicalize_existing};
use crate::shared::ids::sender_key;
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_FILE_NAME_BYTES: usize = 160;
pub const DELIVERED_DIR_NAME: &str = "delivered";

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsafe file name `{name}`: {reason}")]
    UnsafeName { name: String, reason: String },
    #[error("path `{path}` escapes the task directory")]
    PathEscape { path: String },
    #[error("task directory already exists: {path}")]
    TaskDirExists { path: String },
}

fn io_err(path: &Path, source: std::io::Error) -> FileError {
    FileError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Validates and normalizes a filename received from the remote party.
/// Traversal sequences, path separators, control characters and oversized
/// names are rejected outright; remaining non-portable characters map to `_`.
pub fn sanitize_file_name(raw: &str) -> Result<String, FileError> {
    let trimmed = raw.trim();
    let reject = |reason: &str| FileError::UnsafeName {
        name: raw.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(reject("empty name"));
    }
    if trimmed.len() > MAX_FILE_NAME_BYTES {
        return Err(reject("name too long"));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(reject("path separators are not allowed"));
    }
    if trimmed.contains("..") {
        return Err(reject("traversal sequences are not allowed"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(reject("control characters are not allowed"));
    }
    if trimmed.chars().all(|c| c == '.') {
        return Err(reject("dot-only names are not allowed"));
    }

    Ok(trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect())
}

pub fn sender_files_dir(state_root: &Path, sender_id: &str) -> PathBuf {
    state_root.join("files").join(sender_key(sender_id))
}

/// Creates the exclusive working directory for one task. A pre-existing
/// directory means a task id collision and is an error, not a reuse.
pub fn allocate_task_dir(
    state_root: &Path,
    sender_id: &str,
    task_id: &str,
) -> Result<PathBuf, FileError> {
    let parent = sender_files_dir(state_root, sender_id);
    fs::create_dir_all(&parent).map_err(|e| io_err(&parent, e))?;
    let task_dir = parent.join(task_id);
    match fs::create_dir(&task_dir) {
        Ok(()) => Ok(task_dir),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(FileError::TaskDirExists {
                path: task_dir.display().to_string(),
            })
        }
        Err(err) => Err(io_err(&task_dir, err)),
    }
}

/// Resolves `candidate` and fails unless it is a strict descendant of
/// `task_dir`. The candidate itself may not exist yet; its parent must.
pub fn ensure_safe_path(task_dir: &Path, candidate: &Path) -> Result<PathBuf, FileError> {
    let root = canonicalize_existing(task_dir).map_err(|e| io_err(task_dir, e))?;
    let parent = candidate
        .parent()
        .ok_or_else(|| FileError::PathEscape {
            path: candidate.display().to_string(),
        })?;
    let canonical_parent = canonicalize_existing(parent).map_err(|e| io_err(parent, e))?;
    let file_name = candidate.file_name().ok_or_else(|| FileError::PathEscape {
        path: candidate.display().to_string(),
    })?;
    let resolved = canonical_parent.join(file_name);
    if !resolved.starts_with(&root) {
        return Err(FileError::PathEscape {
            path: candidate.display().to_string(),
        });
    }
    Ok(resolved)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Sanitizes the remote name and writes the bytes atomically inside the task
/// directory.
pub fn store_file(task_dir: &Path, raw_name: &str, bytes: &[u8]) -> Result<StoredFile, FileError> {
    let name = sanitize_file_name(raw_name)?;
    let path = ensure_safe_path(task_dir, &task_dir.join(&name))?;
    atomic_write_file(&path, bytes).map_err(|e| io_err(&path, e))?;
    Ok(StoredFile {
        name,
        path,
        size: bytes.len() as u64,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_total(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Removes the task directory recursively, one entry at a time. A failure on
/// one entry is recorded and never aborts the remaining removals, so a single
/// stuck file cannot block reclaiming the rest.
pub fn cleanup_task_dir(task_dir: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    if !task_dir.exists() {
        return report;
    }
    remove_dir_entries(task_dir, &mut report);
    match fs::remove_dir(task_dir) {
        Ok(()) => report.removed += 1,
        Err(err) => report
            .failures
            .push(format!("{}: {err}", task_dir.display())),
    }
    report
}

fn remove_dir_entries(dir: &Path, report: &mut CleanupReport) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            report.failures.push(format!("{}: {err}", dir.display()));
            return;
        }
    };
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                report.failures.push(format!("{}: {err}", dir.display()));
                continue;
            }
        };
        if path.is_dir() {
            remove_dir_entries(&path, report);
            match fs::remove_dir(&path) {
                Ok(()) => report.removed += 1,
                Err(err) => report.failures.push(format!("{}: {err}", path.display())),
            }
        } else {
            match fs::remove_file(&path) {
                Ok(()) => report.removed += 1,
                Err(err) => report.failures.push(format!("{}: {err}", path.display())),
            }
        }
    }
}

/// Moves finished outputs out of the task directory into the sender's
/// delivery directory before cleanup reclaims the task directory. Name
/// collisions get a numeric suffix rather than overwriting an earlier
/// delivery.
pub fn deliver_outputs(
    state_root: &Path,
    sender_id: &str,
    outputs: &[PathBuf],
) -> (Vec<PathBuf>, Vec<String>) {
    let delivered_dir = sender_files_dir(state_root, sender_id).join(DELIVERED_DIR_NAME);
    let mut delivered = Vec::new();
    let mut failures = Vec::new();

    if let Err(err) = fs::create_dir_all(&delivered_dir) {
        failures.push(format!("{}: {err}", delivered_dir.display()));
        return (delivered, failures);
    }

    for output in outputs {
        let name = output
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("output.pdf")
            .to_string();
        let target = unique_delivery_path(&delivered_dir, &name);
        match fs::rename(output, &target) {
            Ok(()) => delivered.push(target),
            Err(err) => failures.push(format!("{}: {err}", output.display())),
        }
    }

    (delivered, failures)
}

fn unique_delivery_path(dir: &Path, name: &str) -> PathBuf {
    let direct = dir.join(name);
    if !direct.exists() {
        return direct;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.to_string(), String::new()),
    };
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
