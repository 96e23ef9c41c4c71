//! Configuration file parser for ~/.config/gather/config.toml.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields`
//! off), though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Top-level engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be
/// specified. Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of feed fetches in flight at once.
    pub max_concurrency: usize,

    /// Maximum number of simultaneous requests to a single remote host.
    pub per_host_limit: usize,

    /// Scheduler tick interval in seconds.
    pub tick_seconds: u64,

    /// Entries older than this many days are never inserted and are
    /// pruned after each sweep (bookmarked entries survive pruning).
    pub retention_days: i64,

    /// Per-request fetch timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Polling interval in seconds for feeds with at most
    /// `low_threshold` entries in the retention window.
    pub interval_low_seconds: i64,

    /// Polling interval in seconds for feeds with at most
    /// `med_threshold` entries in the retention window.
    pub interval_med_seconds: i64,

    /// Polling interval in seconds for feeds above `med_threshold`.
    pub interval_high_seconds: i64,

    /// Upper bound of the low-volume tier (entries per retention window).
    pub low_threshold: i64,

    /// Upper bound of the medium-volume tier.
    pub med_threshold: i64,

    /// User-Agent header sent with every fetch.
    pub user_agent: String,

    /// Whether the periodic scheduler starts enabled.
    pub scheduler_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 40,
            per_host_limit: 4,
            tick_seconds: 60,
            retention_days: 30,
            request_timeout_seconds: 25,
            interval_low_seconds: 20 * 60,
            interval_med_seconds: 60 * 60,
            interval_high_seconds: 2 * 60 * 60,
            low_threshold: 10,
            med_threshold: 200,
            user_agent: format!("gather/{} (+local)", env!("CARGO_PKG_VERSION")),
            scheduler_enabled: true,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        // from a maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {} // Size is within limits, proceed
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "max_concurrency",
                "per_host_limit",
                "tick_seconds",
                "retention_days",
                "request_timeout_seconds",
                "interval_low_seconds",
                "interval_med_seconds",
                "interval_high_seconds",
                "low_threshold",
                "med_threshold",
                "user_agent",
                "scheduler_enabled",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            max_concurrency = config.max_concurrency,
            tick_seconds = config.tick_seconds,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
