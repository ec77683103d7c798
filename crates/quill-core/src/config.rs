use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::event::EventKind;

/// Directory holding project configuration and the event store.
pub const PROJECT_DIR: &str = ".quill";

/// Store file name inside [`PROJECT_DIR`].
pub const STORE_FILE: &str = "ledger.sqlite3";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl ProjectConfig {
    /// Check every section for out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns the first [`SettingsError`] found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.logging.validate()?;
        if self.recorder.ring_capacity == 0 {
            return Err(SettingsError::ZeroRingCapacity);
        }
        if self.uploader.max_batch_size == 0 {
            return Err(SettingsError::ZeroBatchSize);
        }
        if !(self.metrics.idle_threshold_secs.is_finite() && self.metrics.idle_threshold_secs > 0.0)
        {
            return Err(SettingsError::IdleThreshold(self.metrics.idle_threshold_secs));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Events kept in the in-session inspection buffer.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Typing pause that closes an edit burst.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// File used by replay when an event carries no path.
    #[serde(default = "default_file")]
    pub default_file: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            debounce_ms: default_debounce_ms(),
            default_file: default_file(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging settings
// ---------------------------------------------------------------------------

/// How much the recorder captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, with cursor samples unthrottled.
    Verbose,
    /// Per-kind switches and the cursor throttle apply.
    #[default]
    Standard,
    /// As standard, but cursor samples are never recorded.
    Minimal,
}

/// Instructor-controlled capture policy for an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_true")]
    pub track_keystrokes: bool,
    #[serde(default = "default_true")]
    pub track_cursor_moves: bool,
    #[serde(default = "default_true")]
    pub track_paste_events: bool,
    #[serde(default = "default_true")]
    pub track_ai_interactions: bool,
    #[serde(default = "default_true")]
    pub track_run_events: bool,
    /// Minimum spacing between recorded cursor samples, in milliseconds.
    #[serde(default = "default_cursor_interval")]
    pub cursor_tracking_interval: u64,
    /// Periodic upload cadence, in seconds.
    #[serde(default = "default_batch_interval")]
    pub batch_interval: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            track_keystrokes: true,
            track_cursor_moves: true,
            track_paste_events: true,
            track_ai_interactions: true,
            track_run_events: true,
            cursor_tracking_interval: default_cursor_interval(),
            batch_interval: default_batch_interval(),
        }
    }
}

impl LoggingSettings {
    pub const CURSOR_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 1_000..=10_000;
    pub const BATCH_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 3..=30;

    /// # Errors
    ///
    /// Returns an error if an interval is outside its accepted range.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !Self::CURSOR_INTERVAL_RANGE.contains(&self.cursor_tracking_interval) {
            return Err(SettingsError::CursorInterval(self.cursor_tracking_interval));
        }
        if !Self::BATCH_INTERVAL_RANGE.contains(&self.batch_interval) {
            return Err(SettingsError::BatchInterval(self.batch_interval));
        }
        Ok(())
    }

    /// Whether events of `kind` are captured at all.
    #[must_use]
    pub const fn tracks(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Edit => self.track_keystrokes,
            EventKind::Cursor => {
                self.track_cursor_moves && !matches!(self.log_level, LogLevel::Minimal)
            }
            EventKind::Paste => self.track_paste_events,
            EventKind::AiPrompt | EventKind::AiResponse => self.track_ai_interactions,
            EventKind::Run => self.track_run_events,
            _ => true,
        }
    }

    /// Cursor throttle in milliseconds; `None` when unthrottled.
    #[must_use]
    pub const fn cursor_throttle_ms(&self) -> Option<u64> {
        match self.log_level {
            LogLevel::Verbose => None,
            LogLevel::Standard | LogLevel::Minimal => Some(self.cursor_tracking_interval),
        }
    }

    /// Upload cadence in milliseconds.
    #[must_use]
    pub const fn batch_interval_ms(&self) -> u64 {
        self.batch_interval.saturating_mul(1_000)
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("cursor_tracking_interval must be between 1000 and 10000 ms, got {0}")]
    CursorInterval(u64),
    #[error("batch_interval must be between 3 and 30 s, got {0}")]
    BatchInterval(u64),
    #[error("recorder.ring_capacity must be at least 1")]
    ZeroRingCapacity,
    #[error("uploader.max_batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("metrics.idle_threshold_secs must be a positive number, got {0}")]
    IdleThreshold(f64),
}

// ---------------------------------------------------------------------------
// Uploader / metrics / server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Events per upload request; larger queues are split.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Consecutive failed flushes before sync is reported as degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,
    /// Queue length that raises a visible warning.
    #[serde(default = "default_queue_warning")]
    pub queue_warning_threshold: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            degraded_after_failures: default_degraded_after(),
            queue_warning_threshold: default_queue_warning(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Gaps longer than this do not count as active time.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: f64,
    /// Pastes larger than this many characters are flagged.
    #[serde(default = "default_large_paste")]
    pub large_paste_threshold: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            large_paste_threshold: default_large_paste(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum events returned by `GET /events/{id}` without `limit`.
    #[serde(default = "default_events_limit")]
    pub events_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            events_limit: default_events_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub project: ProjectConfig,
    pub user: UserConfig,
    pub resolved_output: String,
    pub store_path: PathBuf,
}

/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed,
/// or fails validation.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_root.join(PROJECT_DIR).join("config.toml");
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<ProjectConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid settings in {}", path.display()))?;
    Ok(config)
}

/// # Errors
///
/// Returns an error if the user config exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("quill/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Store location: `QUILL_DB` if set, else `<root>/.quill/ledger.sqlite3`.
#[must_use]
pub fn store_path(project_root: &Path) -> PathBuf {
    env::var_os("QUILL_DB").map_or_else(
        || project_root.join(PROJECT_DIR).join(STORE_FILE),
        PathBuf::from,
    )
}

/// # Errors
///
/// Returns an error if either config file fails to load.
pub fn resolve_config(project_root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let project = load_project_config(project_root)?;
    let user = load_user_config()?;

    let env_format = env::var("FORMAT").ok();
    let resolved_output = resolve_output(cli_json, user.output.as_deref(), env_format.as_deref());

    Ok(EffectiveConfig {
        project,
        user,
        resolved_output,
        store_path: store_path(project_root),
    })
}

fn resolve_output(cli_json: bool, user_output: Option<&str>, env_format: Option<&str>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

const fn default_true() -> bool {
    true
}

const fn default_ring_capacity() -> usize {
    1_000
}

const fn default_debounce_ms() -> u64 {
    1_000
}

fn default_file() -> String {
    "main.py".to_string()
}

const fn default_cursor_interval() -> u64 {
    5_000
}

const fn default_batch_interval() -> u64 {
    5
}

const fn default_max_batch_size() -> usize {
    500
}

const fn default_degraded_after() -> u32 {
    3
}

const fn default_queue_warning() -> usize {
    5_000
}

const fn default_idle_threshold() -> f64 {
    30.0
}

const fn default_large_paste() -> usize {
    100
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8787
}

const fn default_events_limit() -> usize {
    10_000
}
