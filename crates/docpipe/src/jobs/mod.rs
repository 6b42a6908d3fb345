//! Job records and the retry/dead-letter state machine.

pub mod model;
pub mod retry;

pub use model::{Job, JobPayload, JobStage, JobStatus, JobType, NewJob, ParseEnumError};
pub use retry::{FailureDecision, RetryPolicy};
