//! Editor configuration module.
//!
//! Handles loading, validating, and merging `simple-edit.toml` files. Stock
//! defaults are serialized to a TOML table and the user file is merged on top,
//! so a config file only needs the keys it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [cache]
//! max_states = 50           # Snapshots kept by the filter cache
//! max_age_ms = 300000       # Snapshots older than this are dropped (5 min)
//!
//! [debounce]
//! delay_ms = 150            # Quiet period before a preview render
//! max_concurrent = 10       # Pending debounced calls before new keys are dropped
//! use_animation_frame = true
//! frame_rate = 60           # Frame clock rate in Hz
//!
//! [workers]
//! enabled = true
//! pool_size = 2             # Omit for auto = min(2, CPU cores)
//! timeout_ms = 30000        # Per-job safety timeout
//! restart_threshold = 5     # Errors on a slot before its worker is replaced
//!
//! [fallback]
//! chunk_threshold = 3       # Above this many operations, yield between each
//!
//! [loading]
//! timeout_ms = 10000        # Indicators are force-hidden after this long
//!
//! [preview]
//! worker_cost_threshold = 1000000  # pixels x operations before offloading
//!
//! [watermark]
//! font_path = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILENAME: &str = "simple-edit.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Editor configuration loaded from `simple-edit.toml`.
///
/// All fields have sensible defaults. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditorConfig {
    /// Filter cache bounds.
    pub cache: CacheConfig,
    /// Debounce timing and backpressure.
    pub debounce: DebounceConfig,
    /// Worker pool sizing and timeouts.
    pub workers: WorkersConfig,
    /// Calling-task fallback chunking.
    pub fallback: FallbackConfig,
    /// Loading indicator safety timeout.
    pub loading: LoadingConfig,
    /// Path selection for preview renders.
    pub preview: PreviewConfig,
    /// Watermark resources.
    pub watermark: WatermarkConfig,
}

impl EditorConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_states == 0 {
            return Err(ConfigError::Validation(
                "cache.max_states must be at least 1".into(),
            ));
        }
        if self.debounce.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "debounce.max_concurrent must be at least 1".into(),
            ));
        }
        if !(1..=240).contains(&self.debounce.frame_rate) {
            return Err(ConfigError::Validation(
                "debounce.frame_rate must be 1-240".into(),
            ));
        }
        if self.workers.pool_size == Some(0) {
            return Err(ConfigError::Validation(
                "workers.pool_size must be at least 1 (omit for auto)".into(),
            ));
        }
        if self.workers.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "workers.timeout_ms must be non-zero".into(),
            ));
        }
        if self.loading.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "loading.timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Filter cache bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_states: usize,
    pub max_age_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_states: 50,
            max_age_ms: 5 * 60 * 1000,
        }
    }
}

/// Debounce timing and backpressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebounceConfig {
    pub delay_ms: u64,
    pub max_concurrent: usize,
    pub use_animation_frame: bool,
    pub frame_rate: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            delay_ms: 150,
            max_concurrent: 10,
            use_animation_frame: true,
            frame_rate: 60,
        }
    }
}

impl DebounceConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Length of one frame at `frame_rate`.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    /// Set to false to always use the calling-task paths.
    pub enabled: bool,
    /// Number of worker threads.
    /// When absent, defaults to `min(2, cores)`.
    /// Values larger than the core count are clamped down.
    pub pool_size: Option<usize>,
    pub timeout_ms: u64,
    /// A slot whose error count exceeds this is restarted.
    pub restart_threshold: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: None,
            timeout_ms: 30_000,
            restart_threshold: 5,
        }
    }
}

impl WorkersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Resolve the effective worker count from config.
///
/// - `None` → `min(2, cores)`
/// - `Some(n)` → `min(n, cores)` (user can constrain down, not up)
pub fn effective_pool_size(config: &WorkersConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .pool_size
        .map(|n| n.min(cores))
        .unwrap_or(cores.min(2))
        .max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    pub chunk_threshold: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { chunk_threshold: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadingConfig {
    pub timeout_ms: u64,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl LoadingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewConfig {
    /// Renders whose `pixels x operations` reaches this go to the worker pool.
    pub worker_cost_threshold: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            worker_cost_threshold: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatermarkConfig {
    /// Font used for text watermarks. Text watermarks fail validation without one.
    pub font_path: Option<PathBuf>,
}

/// `EditorConfig::default()` as a TOML table: the layer user files sit on.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(EditorConfig::default()).expect("default config must serialize")
}

/// Lay `overlay` over `base`. Sections merge key by key at every depth; any
/// other overlay value wins outright.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut section), toml::Value::Table(changes)) => {
            for (key, change) in changes {
                let value = match section.remove(&key) {
                    Some(current) => merge_toml(current, change),
                    None => change,
                };
                section.insert(key, value);
            }
            toml::Value::Table(section)
        }
        (_, overlay) => overlay,
    }
}

/// Parse a config file without interpreting it. A missing file is `None`.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(toml::from_str(&text)?))
}

/// Apply an optional user layer to `base`, deserialize, and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<EditorConfig, ConfigError> {
    let layered = match overlay {
        Some(user) => merge_toml(base, user),
        None => base,
    };
    let config: EditorConfig = layered.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Stock defaults with `path` (if it exists) merged on top.
pub fn load_config(path: &Path) -> Result<EditorConfig, ConfigError> {
    resolve_config(stock_defaults_value(), load_raw_config(path)?)
}

/// Returns a fully-commented stock `simple-edit.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Simple Edit Configuration
# =========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# simple-edit looks for simple-edit.toml in the working directory, or the
# file passed with --config. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Filter cache
# ---------------------------------------------------------------------------
[cache]
# Maximum number of saved filter snapshots. Oldest are dropped first.
max_states = 50

# Snapshots older than this many milliseconds are dropped (5 minutes).
max_age_ms = 300000

# ---------------------------------------------------------------------------
# Debounce
# ---------------------------------------------------------------------------
[debounce]
# Quiet period in milliseconds after the last change before rendering.
delay_ms = 150

# Pending debounced calls allowed at once. New keys beyond this are dropped.
max_concurrent = 10

# Wait for the next frame tick after the delay before running.
use_animation_frame = true

# Frame clock rate in Hz.
frame_rate = 60

# ---------------------------------------------------------------------------
# Worker pool
# ---------------------------------------------------------------------------
[workers]
# Disable to run every render on the calling task.
enabled = true

# Number of worker threads. Omit for auto = min(2, CPU cores).
# Values larger than the core count are clamped down.
# pool_size = 2

# Per-job safety timeout in milliseconds.
timeout_ms = 30000

# A worker is replaced once its slot has failed more than this many times.
restart_threshold = 5

# ---------------------------------------------------------------------------
# Fallback processing
# ---------------------------------------------------------------------------
[fallback]
# Runs with more operations than this yield to the frame clock between steps.
chunk_threshold = 3

# ---------------------------------------------------------------------------
# Loading indicators
# ---------------------------------------------------------------------------
[loading]
# Indicators still showing after this many milliseconds are force-hidden.
timeout_ms = 10000

# ---------------------------------------------------------------------------
# Preview
# ---------------------------------------------------------------------------
[preview]
# Renders costing more than this (pixels x operations) go to the worker pool.
worker_cost_threshold = 1000000

# ---------------------------------------------------------------------------
# Watermark
# ---------------------------------------------------------------------------
[watermark]
# TrueType/OpenType font for text watermarks.
# font_path = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
"##
}
