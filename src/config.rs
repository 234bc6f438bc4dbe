// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Layered runtime configuration, loadable from TOML with compiled-in defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

fn default_worker_count() -> usize {
    0
}

fn default_scheduler_task_limit() -> usize {
    0
}

fn default_process_cache_size() -> usize {
    64
}

fn default_global_scheduler_cache_size() -> usize {
    8
}

fn default_other_scheduler_cache_size() -> usize {
    4
}

fn default_cache_byte_limit() -> usize {
    1 << 20
}

fn default_busy_wait_threshold() -> Duration {
    Duration::from_micros(50)
}

fn default_short_threshold() -> Duration {
    Duration::from_millis(1)
}

fn default_long_threshold() -> Duration {
    Duration::from_millis(10)
}

/// The top-level configuration tree, grouped by subsystem rather than as a flat list of
/// environment-variable-style accessors.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub threadpool: ThreadPoolConfig,
    pub blocking: BlockingConfig,
    pub timer: TimerConfig,
}

impl Config {
    /// Parse a `Config` from a TOML document, filling in compiled-in defaults for any
    /// field the document omits.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    /// Load and parse a `Config` from a TOML file on disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&contents)
    }
}

/// Errors loading or parsing a [`Config`].
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read configuration file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

/// The verbosity level of structured logging output, mapped onto [`tracing`] levels at
/// [`crate::lifecycle::Lifecycle::new`] time.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
        }
    }
}

/// Per-thread block-sized allocation cache tuning.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MemoryConfig {
    /// Byte limit per power-of-two bucket before deallocations fall through to the
    /// system allocator. Applies uniformly to every thread-local cache (system
    /// threads, the global scheduler, and other schedulers share one knob since the
    /// cache's layout does not vary by thread kind, only its size would).
    #[serde(default = "default_cache_byte_limit")]
    pub cache_byte_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cache_byte_limit: default_cache_byte_limit(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Soft limit on concurrently resident tasks on the global scheduler; `0` means
    /// unbounded. The scheduler does not currently enforce it (see DESIGN.md).
    #[serde(default = "default_scheduler_task_limit")]
    pub task_resource_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_resource_limit: default_scheduler_task_limit(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ThreadPoolConfig {
    /// Number of schedulers to launch; `0` means auto-detect (`num_cpus::get()`).
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Soft per-worker task-resource limit; `0` means unbounded (see
    /// [`SchedulerConfig::task_resource_limit`]).
    #[serde(default = "default_scheduler_task_limit")]
    pub per_worker_task_resource_limit: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            per_worker_task_resource_limit: default_scheduler_task_limit(),
        }
    }
}

impl ThreadPoolConfig {
    pub(crate) fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BlockingConfig {
    #[serde(default = "default_process_cache_size")]
    pub process_cache_size: usize,
    #[serde(default = "default_global_scheduler_cache_size")]
    pub global_scheduler_cache_size: usize,
    #[serde(default = "default_other_scheduler_cache_size")]
    pub other_scheduler_cache_size: usize,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            process_cache_size: default_process_cache_size(),
            global_scheduler_cache_size: default_global_scheduler_cache_size(),
            other_scheduler_cache_size: default_other_scheduler_cache_size(),
        }
    }
}

/// Which early-wakeup algorithm the timer thread uses for longer sleeps.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutAlgorithm {
    #[default]
    ShortLongThreshold,
    /// Always wait for the exact deadline (no early wakeup); useful for tests that
    /// want to reason about precision without the tiered algorithm's adjustments.
    Exact,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimerConfig {
    /// How close to a deadline the timer thread switches from sleeping to spinning.
    #[serde(default = "default_busy_wait_threshold")]
    pub busy_wait_threshold: Duration,
    /// Below this remaining duration, the early-wakeup algorithm enters the busy-wait
    /// window rather than sleeping again.
    #[serde(default = "default_short_threshold")]
    pub early_wakeup_short_threshold: Duration,
    /// Above this remaining duration, the early-wakeup algorithm re-checks rather than
    /// sleeping all the way to the deadline in one step.
    #[serde(default = "default_long_threshold")]
    pub early_wakeup_long_threshold: Duration,
    pub algorithm: TimeoutAlgorithm,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            busy_wait_threshold: default_busy_wait_threshold(),
            early_wakeup_short_threshold: default_short_threshold(),
            early_wakeup_long_threshold: default_long_threshold(),
            algorithm: TimeoutAlgorithm::default(),
        }
    }
}
