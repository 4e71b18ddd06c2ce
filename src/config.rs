//! Configuration loading and validation.
//!
//! Foreman reads a single `foreman.toml`. Every section has serde defaults
//! so an empty file is a valid configuration; the defaults match the
//! documented operating values (pool of 20, 60 s reaper cadence, 2 h / 20 min
//! stale thresholds, failure tolerance of 3, retest stride of 2).

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// SQLite pool and operation deadlines.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Stale-session reclamation cadence and thresholds.
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Completion-gate policy knobs.
    #[serde(default)]
    pub gate: GateConfig,

    /// Event fan-out tuning.
    #[serde(default)]
    pub events: EventsConfig,

    /// Agent driver invocation and cancellation grace.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Default model identifiers per session kind.
    #[serde(default)]
    pub models: ModelsConfig,
}

/// SQLite pool sizing and per-operation deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Maximum pooled connections.
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    /// Connections kept open while idle.
    #[serde(default = "default_pool_idle")]
    pub pool_idle: u32,

    /// Per-operation deadline in seconds, including retries.
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,

    /// Maximum retry attempts for the transient error class.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_max: default_pool_max(),
            pool_idle: default_pool_idle(),
            op_timeout_secs: default_op_timeout_secs(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Reaper cadence and the type-aware staleness thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between reaper sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,

    /// Initializer sessions are stale after this many seconds without a
    /// heartbeat.
    #[serde(default = "default_init_stale_after_secs")]
    pub init_stale_after_secs: u64,

    /// Coding sessions are stale after this many seconds without a
    /// heartbeat.
    #[serde(default = "default_coding_stale_after_secs")]
    pub coding_stale_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            init_stale_after_secs: default_init_stale_after_secs(),
            coding_stale_after_secs: default_coding_stale_after_secs(),
        }
    }
}

/// Completion-gate policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// In autonomous mode, block a non-critical epic once more than this
    /// many epic-tests have failed.
    #[serde(default = "default_auto_failure_tolerance")]
    pub auto_failure_tolerance: u32,

    /// Case-insensitive substrings that mark an epic as critical.
    #[serde(default = "default_critical_epic_keywords")]
    pub critical_epic_keywords: Vec<String>,

    /// Record a retest recommendation every N completed epics.
    #[serde(default = "default_retest_stride")]
    pub retest_stride: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            auto_failure_tolerance: default_auto_failure_tolerance(),
            critical_epic_keywords: default_critical_epic_keywords(),
            retest_stride: default_retest_stride(),
        }
    }
}

/// Event bus tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Buffered events per subscriber before the lag policy drops the
    /// oldest non-terminal entries.
    #[serde(default = "default_event_buffer")]
    pub buffer_per_subscriber: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_per_subscriber: default_event_buffer(),
        }
    }
}

/// Agent driver invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Program that executes one session and emits JSONL events on stdout.
    #[serde(default = "default_runner_command")]
    pub command: String,

    /// Fixed arguments placed before the per-session payload.
    #[serde(default)]
    pub args: Vec<String>,

    /// Seconds to wait after signalling cancel before the session is
    /// detached and marked failed.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            args: Vec::new(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Default model identifiers per session kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Model used by initializer sessions unless overridden per call.
    #[serde(default = "default_initializer_model")]
    pub initializer: String,

    /// Model used by coding sessions unless overridden per call.
    #[serde(default = "default_coding_model")]
    pub coding: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            initializer: default_initializer_model(),
            coding: default_coding_model(),
        }
    }
}

/// Resolved runtime paths under `~/.foreman`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Runtime directory (`~/.foreman`).
    pub root: PathBuf,
    /// Configuration file path.
    pub config_toml: PathBuf,
    /// Data directory path.
    pub data_dir: PathBuf,
    /// Orchestrator database path.
    pub database: PathBuf,
    /// Log directory path.
    pub logs_dir: PathBuf,
}

// Default value functions for serde

fn default_pool_max() -> u32 {
    20
}
fn default_pool_idle() -> u32 {
    10
}
fn default_op_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_reaper_interval_secs() -> u64 {
    60
}
fn default_init_stale_after_secs() -> u64 {
    7200
}
fn default_coding_stale_after_secs() -> u64 {
    1200
}
fn default_auto_failure_tolerance() -> u32 {
    3
}
fn default_critical_epic_keywords() -> Vec<String> {
    [
        "authentication",
        "database",
        "payment",
        "security",
        "core api",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}
fn default_retest_stride() -> u32 {
    2
}
fn default_event_buffer() -> usize {
    64
}
fn default_runner_command() -> String {
    "foreman-agent".to_owned()
}
fn default_cancel_grace_secs() -> u64 {
    30
}
fn default_initializer_model() -> String {
    "claude-sonnet-4".to_owned()
}
fn default_coding_model() -> String {
    "claude-sonnet-4".to_owned()
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if a value
/// fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Validate cross-field constraints that serde defaults cannot express.
///
/// # Errors
///
/// Returns an error naming the first offending value.
pub fn validate(config: &Config) -> anyhow::Result<()> {
    if config.database.pool_max == 0 {
        anyhow::bail!("database.pool_max must be at least 1");
    }
    if config.database.pool_idle > config.database.pool_max {
        anyhow::bail!(
            "database.pool_idle ({}) exceeds database.pool_max ({})",
            config.database.pool_idle,
            config.database.pool_max
        );
    }
    if config.events.buffer_per_subscriber == 0 {
        anyhow::bail!("events.buffer_per_subscriber must be at least 1");
    }
    if config.reaper.interval_secs == 0 {
        anyhow::bail!("reaper.interval_secs must be at least 1");
    }
    Ok(())
}

/// Resolve the runtime directory (`~/.foreman`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".foreman"))
}

/// Resolve runtime paths under `~/.foreman`.
///
/// # Errors
///
/// Returns an error when the base directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let root = config_dir()?;
    let config_toml = root.join("foreman.toml");
    let data_dir = root.join("data");
    let database = data_dir.join("foreman.db");
    let logs_dir = root.join("logs");

    Ok(RuntimePaths {
        root,
        config_toml,
        data_dir,
        database,
        logs_dir,
    })
}

/// Load the default configuration from `~/.foreman/foreman.toml`.
///
/// Falls back to built-in defaults when the file does not exist.
///
/// # Errors
///
/// Returns an error if paths cannot be resolved or parsing fails.
pub fn load_default_config() -> anyhow::Result<Config> {
    let paths = runtime_paths()?;
    if paths.config_toml.exists() {
        load_config(&paths.config_toml)
    } else {
        Ok(Config::default())
    }
}
