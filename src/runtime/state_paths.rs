use super::RuntimeError;
use crate::queue::QueuePaths;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        let queue = QueuePaths::from_state_root(&self.root);
        let mut dirs = vec![
            self.root.join("files"),
            self.root.join("logs"),
            self.root.join("store"),
            self.root.join("daemon"),
        ];
        dirs.extend(queue.all().into_iter().cloned());
        dirs
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(crate::config::SETTINGS_FILE_NAME)
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn supervisor_state_path(&self) -> PathBuf {
        self.daemon_dir().join("runtime.json")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }
}

pub const DEFAULT_STATE_ROOT_DIR: &str = ".docsmith";

pub fn default_state_root_path() -> Result<PathBuf, RuntimeError> {
    if let Some(root) = std::env::var_os("DOCSMITH_STATE_ROOT") {
        return Ok(PathBuf::from(root));
    }
    let home = std::env::var_os("HOME").ok_or(RuntimeError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_creates_required_directories() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path().join("state"));
        bootstrap_state_root(&paths).expect("bootstrap succeeds");

        for required in paths.required_directories() {
            assert!(
                required.is_dir(),
                "missing directory: {}",
                required.display()
            );
        }
    }

    #[test]
    fn settings_file_lives_at_the_state_root() {
        let paths = StatePaths::new("/tmp/.docsmith");
        assert_eq!(
            paths.settings_file(),
            PathBuf::from("/tmp/.docsmith/config.yaml")
        );
    }
}
