use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunking::{ChunkingOptions, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS};
use crate::extraction::DEFAULT_MIN_TEXT_LENGTH;
use crate::jobs::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::jobs::RetryPolicy;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    /// SQLite file shared by every worker. Defaults to
    /// `~/.docpipe/data/docpipe.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: None,
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            chunking: ChunkingConfig::default(),
            extraction: ExtractionConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// A PROCESSING job untouched for this long is presumed abandoned.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Job slots per process. Each slot runs one job at a time.
    #[serde(default = "default_slots")]
    pub slots: usize,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_liveness_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_slots() -> usize {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            slots: default_slots(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Attempts given to newly created jobs.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.base_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// `whitespace`, or `cl100k` when built with the `tiktoken` feature.
    #[serde(default = "default_token_counter")]
    pub token_counter: String,
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_overlap_tokens() -> usize {
    DEFAULT_OVERLAP_TOKENS
}

fn default_token_counter() -> String {
    "whitespace".to_string()
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            token_counter: default_token_counter(),
        }
    }
}

impl ChunkingConfig {
    pub fn options(&self) -> ChunkingOptions {
        ChunkingOptions {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Shorter extracted text (after trimming) is treated as a failed
    /// extraction.
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
}

fn default_min_text_length() -> usize {
    DEFAULT_MIN_TEXT_LENGTH
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_text_length: default_min_text_length(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    /// Append to the `audit_logs` table.
    #[default]
    Database,
    /// Log lines only.
    Log,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub sink: AuditSinkKind,
}
