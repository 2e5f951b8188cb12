use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn log_path(state_root: &Path, name: &str) -> PathBuf {
    state_root.join("logs").join(name)
}

pub fn append_log_line(state_root: &Path, name: &str, line: &str) -> std::io::Result<()> {
    let path = log_path(state_root, name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{line}")
}

pub fn append_router_log(state_root: &Path, now: i64, event: &str, detail: &str) {
    let _ = append_log_line(state_root, "router.log", &format!("ts={now} event={event} {detail}"));
}

pub fn append_tools_log(state_root: &Path, now: i64, event: &str, detail: &str) {
    let _ = append_log_line(state_root, "tools.log", &format!("ts={now} event={event} {detail}"));
}

pub fn append_runtime_log(state_root: &Path, level: &str, event: &str, detail: &str) {
    let now = crate::shared::now_secs();
    let _ = append_log_line(
        state_root,
        "runtime.log",
        &format!("ts={now} level={level} event={event} {detail}"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_create_the_log_directory_and_accumulate_lines() {
        let dir = tempdir().expect("tempdir");
        append_router_log(dir.path(), 10, "route", "sender=u1");
        append_router_log(dir.path(), 11, "route", "sender=u2");

        let raw = fs::read_to_string(log_path(dir.path(), "router.log")).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ts=10 event=route sender=u1"));
    }
}
