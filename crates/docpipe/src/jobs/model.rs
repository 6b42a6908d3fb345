use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Lifecycle status of a job.
///
/// `PENDING -> PROCESSING -> COMPLETED`, or back to `PENDING` on a
/// retryable failure, or `DEAD` once attempts are exhausted. `FAILED` is
/// reserved for job types that fail without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Dead => "DEAD",
        }
    }

    /// Terminal statuses never change without outside intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "DEAD" => Ok(JobStatus::Dead),
            other => Err(ParseEnumError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Finer-grained progress marker inside `PROCESSING`, persisted after every
/// step so a status query can tell where a running job is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Queued,
    Initializing,
    Extraction,
    Chunking,
    Persisting,
    Completed,
    Failed,
    Dead,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Initializing => "initializing",
            JobStage::Extraction => "extraction",
            JobStage::Chunking => "chunking",
            JobStage::Persisting => "persisting",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStage::Queued),
            "initializing" => Ok(JobStage::Initializing),
            "extraction" => Ok(JobStage::Extraction),
            "chunking" => Ok(JobStage::Chunking),
            "persisting" => Ok(JobStage::Persisting),
            "completed" => Ok(JobStage::Completed),
            "failed" => Ok(JobStage::Failed),
            "dead" => Ok(JobStage::Dead),
            other => Err(ParseEnumError {
                kind: "job stage",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of work a job represents. Workers only claim the types they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    DocumentProcessing,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DocumentProcessing => "DOCUMENT_PROCESSING",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DOCUMENT_PROCESSING" => Ok(JobType::DocumentProcessing),
            other => Err(ParseEnumError {
                kind: "job type",
                value: other.to_string(),
            }),
        }
    }
}

/// Typed job payload, one variant per [`JobType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    DocumentProcessing {
        file_path: String,
        mime_type: String,
    },
}

impl JobPayload {
    pub fn document_processing(file_path: impl Into<String>, mime_type: impl Into<String>) -> Self {
        JobPayload::DocumentProcessing {
            file_path: file_path.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::DocumentProcessing { .. } => JobType::DocumentProcessing,
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub stage: JobStage,
    pub document_id: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub error: Option<String>,
    pub payload: JobPayload,
    /// Identifies the claim currently holding the job. `None` unless
    /// `PROCESSING`; every write made on behalf of a run must present it.
    pub claim_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at <= now
    }
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub document_id: String,
    pub payload: JobPayload,
    /// Raised to 1 on insert.
    pub max_attempts: u32,
}

impl NewJob {
    pub fn document_processing(
        document_id: impl Into<String>,
        file_path: impl Into<String>,
        mime_type: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            payload: JobPayload::document_processing(file_path, mime_type),
            max_attempts,
        }
    }
}
