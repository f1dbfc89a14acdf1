//! Configuration for ptyshell.
//!
//! Loaded from `~/.ptyshell/config.toml`. Every field is optional:
//!
//! ```toml
//! # Shells tried in order; the first executable one is started
//! shells = ["/bin/bash", "/bin/sh"]
//!
//! # Prefix on every message sent to the output callback
//! output_tag = "ISHELL_OUTPUT:"
//!
//! # Log filter for the demo console (overridden by PTYSHELL_LOG)
//! log_level = "info"
//!
//! [terminal]
//! cols = 80
//! rows = 24
//!
//! [timing]
//! grace_period_ms = 200
//! poll_interval_ms = 150
//!
//! [reader]
//! chunk_size = 4096
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::output::DEFAULT_OUTPUT_TAG;

/// Longest accepted SIGTERM grace period
const MAX_GRACE_PERIOD_MS: u64 = 10_000;
/// Longest accepted poll timeout for the background loops
const MAX_POLL_INTERVAL_MS: u16 = 1_000;
/// Largest accepted read chunk
const MAX_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell candidates, absolute paths, in order of preference
    pub shells: Vec<String>,
    /// Prefix on every output message
    pub output_tag: String,
    /// Log filter directive
    pub log_level: String,
    /// Initial terminal size
    pub terminal: TerminalConfig,
    /// Shutdown and polling timings
    pub timing: TimingConfig,
    /// Output pump settings
    pub reader: ReaderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shells: vec!["/bin/bash".to_string(), "/bin/sh".to_string()],
            output_tag: DEFAULT_OUTPUT_TAG.to_string(),
            log_level: "info".to_string(),
            terminal: TerminalConfig::default(),
            timing: TimingConfig::default(),
            reader: ReaderConfig::default(),
        }
    }
}

/// Terminal size settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Timing settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Time a shell gets to exit after SIGTERM before SIGKILL
    pub grace_period_ms: u64,
    /// Upper bound on how long a background loop sleeps between checks
    pub poll_interval_ms: u16,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 200,
            poll_interval_ms: 150,
        }
    }
}

impl TimingConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Reader settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Bytes read from the PTY per chunk
    pub chunk_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self { chunk_size: 4096 }
    }
}

impl Config {
    /// Load `~/.ptyshell/config.toml`, falling back to the defaults when the
    /// file is missing, unreadable or invalid
    pub fn load() -> Self {
        Self::try_load().unwrap_or_else(|e| {
            warn!("{}; using default configuration", e);
            Self::default()
        })
    }

    /// Like [`load`](Self::load) but reports a bad file instead of ignoring it.
    /// A missing file still yields the defaults.
    pub fn try_load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shells.is_empty() {
            return Err(ConfigError::Invalid("shells must not be empty".to_string()));
        }
        if let Some(shell) = self.shells.iter().find(|s| !s.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "shell {shell:?} is not an absolute path"
            )));
        }
        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::Invalid(format!(
                "terminal size {}x{} must be positive",
                self.terminal.cols, self.terminal.rows
            )));
        }
        if self.timing.poll_interval_ms == 0 || self.timing.poll_interval_ms > MAX_POLL_INTERVAL_MS
        {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}"
            )));
        }
        if self.timing.grace_period_ms > MAX_GRACE_PERIOD_MS {
            return Err(ConfigError::Invalid(format!(
                "grace_period_ms must be at most {MAX_GRACE_PERIOD_MS}"
            )));
        }
        if self.reader.chunk_size == 0 || self.reader.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        Ok(())
    }

    /// Directory holding the config file and the demo console's log
    pub fn config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".ptyshell"))
    }

    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
