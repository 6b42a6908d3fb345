use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::extraction::ExtractionError;
use crate::jobs::JobStatus;

#[derive(Error, Debug)]
pub enum DocpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize output: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Could not determine home directory for the default database path")]
    NoHomeDirectory,
}

/// Failures inside one job execution. Every variant is folded into the
/// retry decision at the job boundary, except store connectivity loss
/// (see [`PipelineError::is_connectivity`]).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Chunking produced no chunks")]
    ChunkingProducedNothing,

    #[error("Persistence failed: {0}")]
    PersistenceFailed(#[from] DatabaseError),

    /// The job stopped being ours mid-run (reclaimed by a liveness sweep).
    #[error("Job {0} is no longer held by this worker")]
    LeaseLost(String),
}

impl PipelineError {
    /// True when the store itself went away, as opposed to the job failing.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, PipelineError::PersistenceFailed(e) if e.is_connectivity())
    }
}

impl From<ExtractionError> for PipelineError {
    fn from(e: ExtractionError) -> Self {
        PipelineError::ExtractionFailed(e.to_string())
    }
}

/// Errors from the job query and admin surface.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is {status}, only DEAD jobs can be retried")]
    NotDead { id: String, status: JobStatus },

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker slot {slot} panicked")]
    Panicked { slot: usize },

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),
}

pub type Result<T> = std::result::Result<T, DocpipeError>;
