use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
}

pub const SETTINGS_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub tasks: TaskSettings,
    #[serde(default)]
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_ms: u64,
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts per tool step, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Inactive tasks are reclaimed once this many seconds old.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    /// Wall-clock budget for one task's Processing phase.
    #[serde(default = "default_processing_timeout_seconds")]
    pub processing_timeout_seconds: i64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub binary: String,
    #[serde(default = "default_tool_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_capture_limit_bytes")]
    pub capture_limit_bytes: usize,
    #[serde(default = "default_ghostscript")]
    pub ghostscript: ToolSpec,
    #[serde(default = "default_libreoffice")]
    pub libreoffice: ToolSpec,
    #[serde(default = "default_pdfinfo")]
    pub pdfinfo: ToolSpec,
    #[serde(default = "default_scanner")]
    pub scanner: ToolSpec,
    #[serde(default = "default_img2pdf")]
    pub img2pdf: ToolSpec,
    /// Tried in order for markdown conversion; first success wins.
    #[serde(default = "default_markdown_chain")]
    pub markdown_chain: Vec<ToolSpec>,
}

fn default_max_concurrency() -> usize {
    4
}
fn default_min_poll_ms() -> u64 {
    100
}
fn default_max_poll_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_seconds() -> u64 {
    5
}
fn default_ttl_seconds() -> i64 {
    86_400
}
fn default_processing_timeout_seconds() -> i64 {
    600
}
fn default_sweep_interval_seconds() -> u64 {
    30
}
fn default_tool_timeout_seconds() -> u64 {
    300
}
fn default_capture_limit_bytes() -> usize {
    64 * 1024
}
fn default_ghostscript() -> ToolSpec {
    ToolSpec {
        binary: "gs".to_string(),
        timeout_seconds: 300,
    }
}
fn default_libreoffice() -> ToolSpec {
    ToolSpec {
        binary: "soffice".to_string(),
        timeout_seconds: 180,
    }
}
fn default_pdfinfo() -> ToolSpec {
    ToolSpec {
        binary: "pdfinfo".to_string(),
        timeout_seconds: 60,
    }
}
fn default_scanner() -> ToolSpec {
    ToolSpec {
        binary: "docsmith-scan".to_string(),
        timeout_seconds: 600,
    }
}
fn default_img2pdf() -> ToolSpec {
    ToolSpec {
        binary: "img2pdf".to_string(),
        timeout_seconds: 120,
    }
}
fn default_markdown_chain() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            binary: "md-to-pdf".to_string(),
            timeout_seconds: 120,
        },
        ToolSpec {
            binary: "md2pdf".to_string(),
            timeout_seconds: 120,
        },
        ToolSpec {
            binary: "pandoc".to_string(),
            timeout_seconds: 120,
        },
    ]
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            min_poll_ms: default_min_poll_ms(),
            max_poll_ms: default_max_poll_ms(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            processing_timeout_seconds: default_processing_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            capture_limit_bytes: default_capture_limit_bytes(),
            ghostscript: default_ghostscript(),
            libreoffice: default_libreoffice(),
            pdfinfo: default_pdfinfo(),
            scanner: default_scanner(),
            img2pdf: default_img2pdf(),
            markdown_chain: default_markdown_chain(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Missing settings file is not an error; the defaults are a complete
    /// working configuration.
    pub fn load_or_default(state_root: &Path) -> Result<Self, ConfigError> {
        let path = state_root.join(SETTINGS_FILE_NAME);
        if !path.exists() {
            return Ok(Settings::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_concurrency == 0 {
            return Err(ConfigError::Settings(
                "queue.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.queue.min_poll_ms == 0 || self.queue.min_poll_ms > self.queue.max_poll_ms {
            return Err(ConfigError::Settings(
                "queue poll bounds must satisfy 0 < min_poll_ms <= max_poll_ms".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.tasks.ttl_seconds <= 0 || self.tasks.processing_timeout_seconds <= 0 {
            return Err(ConfigError::Settings(
                "task deadlines must be positive".to_string(),
            ));
        }
        if self.tools.markdown_chain.is_empty() {
            return Err(ConfigError::Settings(
                "tools.markdown_chain must name at least one converter".to_string(),
            ));
        }
        for spec in self.tool_specs() {
            if spec.binary.trim().is_empty() {
                return Err(ConfigError::Settings(
                    "tool binary names must be non-empty".to_string(),
                ));
            }
            if spec.timeout_seconds == 0 {
                return Err(ConfigError::Settings(format!(
                    "tool `{}` must have a positive timeout",
                    spec.binary
                )));
            }
        }
        Ok(())
    }

    fn tool_specs(&self) -> Vec<&ToolSpec> {
        let mut specs = vec![
            &self.tools.ghostscript,
            &self.tools.libreoffice,
            &self.tools.pdfinfo,
            &self.tools.scanner,
            &self.tools.img2pdf,
        ];
        specs.extend(self.tools.markdown_chain.iter());
        specs
    }
}
