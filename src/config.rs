use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Bomharvest";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// ~/.bomharvest/ unless overridden by configuration.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bomharvest")
}

/// Default location of the run checkpoint.
pub fn default_checkpoint_path() -> PathBuf {
    app_data_dir().join("checkpoint.json")
}

/// Default directory for worker spill files.
pub fn default_fallback_dir() -> PathBuf {
    app_data_dir().join("fallback")
}

/// Default SQLite store for rows and summaries.
pub fn default_database_path() -> PathBuf {
    app_data_dir().join("bom.sqlite")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter(debug: bool) -> &'static str {
    if debug {
        "bomharvest=debug,info"
    } else {
        "bomharvest=info,warn"
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Retry policy for infrastructure failures (timeouts, worker crashes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 1,
        }
    }
}

/// Labels and tolerances that describe the BOM table on a drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    /// Header label that marks the start of the table.
    pub anchor_text: String,
    /// At least one of these must appear on the header line.
    pub header_keywords: Vec<String>,
    /// Header column under which the terminator is searched.
    pub secondary_header: String,
    /// Label that closes the table region.
    pub terminator: String,
    /// Header labels used to estimate the average glyph width.
    pub width_labels: Vec<String>,
    /// Row text containing any of these ends row consumption.
    pub termination_keywords: Vec<String>,
    pub row_tolerance_y: f32,
    pub column_tolerance_x: f32,
    /// Rows empty in this many leading columns are dropped as noise.
    pub noise_leading_columns: usize,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            anchor_text: "PT NO".into(),
            header_keywords: vec![
                "DESCRIPTION".into(),
                "QTY".into(),
                "N.S.".into(),
                "SIZE".into(),
                "ITEM CODE".into(),
            ],
            secondary_header: "DESCRIPTION".into(),
            terminator: "CUT PIPE LENGTH".into(),
            width_labels: vec!["PT NO".into(), "DESCRIPTION".into(), "QTY".into()],
            termination_keywords: vec!["TOTAL".into(), "CUT PIPE LENGTH".into()],
            row_tolerance_y: 3.0,
            column_tolerance_x: 15.0,
            noise_leading_columns: 2,
        }
    }
}

/// Full run configuration. Every field has a default so a partial TOML file
/// (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub input_dir: PathBuf,
    pub rows_output: PathBuf,
    pub summary_output: PathBuf,
    pub database_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub fallback_dir: PathBuf,
    /// 0 means unlimited.
    pub max_files: usize,
    /// Overrides the computed worker count.
    pub workers: Option<usize>,
    pub per_file_timeout_secs: u64,
    pub max_file_size_mb: u64,
    /// Upper clamp of the per-worker memory budget.
    pub max_memory_per_worker_mb: u64,
    pub writer_pool_size: usize,
    pub retry: RetrySettings,
    pub resume: bool,
    pub retry_failed_only: bool,
    pub debug: bool,
    pub heartbeat_interval_ms: u64,
    pub stall_multiple: u32,
    pub batch_rows: usize,
    pub batch_interval_ms: u64,
    pub writer_send_timeout_ms: u64,
    pub join_timeout_secs: u64,
    pub pdfium_library_path: Option<PathBuf>,
    pub layout: LayoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            rows_output: PathBuf::from("bom_rows.csv"),
            summary_output: PathBuf::from("bom_summary.csv"),
            database_path: default_database_path(),
            checkpoint_path: default_checkpoint_path(),
            fallback_dir: default_fallback_dir(),
            max_files: 0,
            workers: None,
            per_file_timeout_secs: 120,
            max_file_size_mb: 200,
            max_memory_per_worker_mb: 4096,
            writer_pool_size: 2,
            retry: RetrySettings::default(),
            resume: false,
            retry_failed_only: false,
            debug: false,
            heartbeat_interval_ms: 2_000,
            stall_multiple: 5,
            batch_rows: 500,
            batch_interval_ms: 2_000,
            writer_send_timeout_ms: 10_000,
            join_timeout_secs: 30,
            pdfium_library_path: None,
            layout: LayoutSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file and validate them.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.writer_pool_size == 0 {
            return Err(invalid("writer_pool_size", "must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(invalid("workers", "must be at least 1 when set"));
        }
        if self.per_file_timeout_secs == 0 {
            return Err(invalid("per_file_timeout_secs", "must be positive"));
        }
        if self.heartbeat_interval_ms == 0 || self.stall_multiple == 0 {
            return Err(invalid("heartbeat_interval_ms", "heartbeat interval and stall multiple must be positive"));
        }
        if self.batch_rows == 0 {
            return Err(invalid("batch_rows", "must be at least 1"));
        }
        if self.batch_interval_ms == 0 {
            return Err(invalid("batch_interval_ms", "must be positive"));
        }
        if self.layout.anchor_text.trim().is_empty() {
            return Err(invalid("layout.anchor_text", "must not be empty"));
        }
        if self.layout.terminator.trim().is_empty() {
            return Err(invalid("layout.terminator", "must not be empty"));
        }
        if !(self.layout.row_tolerance_y > 0.0) || !(self.layout.column_tolerance_x > 0.0) {
            return Err(invalid("layout", "tolerances must be positive"));
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn per_file_timeout(&self) -> Duration {
        Duration::from_secs(self.per_file_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn writer_send_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_send_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}
