#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! [`RuntimeConfig`] is built in code with `with_*` methods or, with the
//! `config-file` feature, loaded from TOML or JSON:
//!
//! ```toml
//! max_cached_message_age = 2
//! min_cached_message_size = 4096
//!
//! [runner]
//! thread_name = "my-app-script"
//! ```
//!
//! `max_cached_message_age` has no default and must always be given.

#[cfg(feature = "config-file")]
use std::path::Path;
use std::time::Duration;

#[cfg(feature = "config-file")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages whose encoded length is below this are never cached.
pub const DEFAULT_MIN_CACHED_MESSAGE_SIZE: usize = 10_000;

const DEFAULT_THREAD_NAME: &str = "reflow-script";
const DEFAULT_PAUSE_POLL_INTERVAL_MS: u64 = 10;

/// Settings for the script thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct RunnerConfig {
    /// Name given to each spawned script thread.
    pub thread_name: String,
    /// Upper bound on how long a paused script sleeps between request checks.
    pub pause_poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            pause_poll_interval_ms: DEFAULT_PAUSE_POLL_INTERVAL_MS,
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_pause_poll_interval_ms(mut self, ms: u64) -> Self {
        self.pause_poll_interval_ms = ms.max(1);
        self
    }

    #[must_use]
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
pub struct RuntimeConfig {
    /// Runs a cached reference stays live for a session after it was last
    /// sent. `0` means a reference only survives within the run that sent it.
    pub max_cached_message_age: u64,
    #[cfg_attr(feature = "config-file", serde(default = "default_min_cached_message_size"))]
    pub min_cached_message_size: usize,
    #[cfg_attr(feature = "config-file", serde(default))]
    pub runner: RunnerConfig,
}

#[cfg(feature = "config-file")]
fn default_min_cached_message_size() -> usize {
    DEFAULT_MIN_CACHED_MESSAGE_SIZE
}

impl RuntimeConfig {
    #[must_use]
    pub fn new(max_cached_message_age: u64) -> Self {
        Self {
            max_cached_message_age,
            min_cached_message_size: DEFAULT_MIN_CACHED_MESSAGE_SIZE,
            runner: RunnerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_max_cached_message_age(mut self, age: u64) -> Self {
        self.max_cached_message_age = age;
        self
    }

    #[must_use]
    pub fn with_min_cached_message_size(mut self, bytes: usize) -> Self {
        self.min_cached_message_size = bytes;
        self
    }

    #[must_use]
    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    /// Parse from a TOML string.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse from a JSON string.
    #[cfg(feature = "config-file")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    #[cfg(feature = "config-file")]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// Errors from loading a [`RuntimeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "config-file")]
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "config-file")]
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
