//! Operations exposed to the surrounding application: document intake,
//! job status, dead-letter listing and the admin retry.
//!
//! Callers are expected to have checked permissions already; nothing here
//! looks at roles.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::audit::{AuditAction, AuditEvent, Auditor};
use crate::db::{chunk_repo, document_repo, job_repo, Database, DatabaseError};
use crate::document::{Document, NewDocument, StoredChunk};
use crate::error::JobError;
use crate::jobs::{Job, JobStage, JobStatus, JobType, NewJob};

/// Default bound for [`dead_jobs`].
pub const DEAD_JOB_LIMIT: u32 = 50;

/// Stable, camelCase view of a job for an HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub stage: JobStage,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub document_id: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            stage: job.stage,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            next_run_at: job.next_run_at,
            document_id: job.document_id,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Result of accepting an upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub document: Document,
    pub job: JobStatusView,
}

/// Records an uploaded file and queues its processing job in one
/// transaction, then returns without doing any processing.
pub fn submit_upload(
    db: &Database,
    auditor: &Auditor,
    upload: &NewDocument,
    max_attempts: u32,
) -> Result<Submission, DatabaseError> {
    let now = Utc::now();
    let (document, job) = db.with_tx(|tx| -> Result<(Document, Job), DatabaseError> {
        let document = document_repo::insert_in(tx, upload, now)?;
        let job = job_repo::insert_in(
            tx,
            &NewJob::document_processing(
                &document.id,
                &document.file_path,
                &document.mime_type,
                max_attempts,
            ),
            now,
        )?;
        Ok((document, job))
    })?;

    log::info!(
        "Accepted upload {} ({}), queued job {}",
        document.id,
        document.file_name,
        job.id
    );

    auditor.emit(
        AuditEvent::document(
            AuditAction::DOCUMENT_UPLOADED,
            &document.id,
            json!({
                "fileName": document.file_name,
                "mimeType": document.mime_type,
                "sizeBytes": document.size_bytes,
            }),
        )
        .with_actor(&document.owner_id),
    );
    auditor.emit(
        AuditEvent::job(
            AuditAction::JOB_CREATED,
            &job.id,
            json!({ "documentId": document.id, "type": job.job_type }),
        )
        .with_actor(&document.owner_id),
    );

    Ok(Submission {
        document,
        job: job.into(),
    })
}

/// Queues a processing job for an existing document: PENDING, zero
/// attempts, eligible immediately. A `max_attempts` of 0 is stored as 1.
pub fn create_job(
    db: &Database,
    document_id: &str,
    file_path: &str,
    mime_type: &str,
    max_attempts: u32,
) -> Result<JobStatusView, JobError> {
    let job = job_repo::create(
        db,
        &NewJob::document_processing(document_id, file_path, mime_type, max_attempts),
        Utc::now(),
    )
    .map_err(|e| match e {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            JobError::DocumentNotFound(document_id.to_string())
        }
        other => JobError::Database(other),
    })?;
    Ok(job.into())
}

/// Latest persisted state of a job.
pub fn job_status(db: &Database, job_id: &str) -> Result<JobStatusView, JobError> {
    job_repo::find_by_id(db, job_id)?
        .map(JobStatusView::from)
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))
}

/// DEAD jobs, most recently updated first, at most `limit`.
pub fn dead_jobs(db: &Database, limit: u32) -> Result<Vec<JobStatusView>, JobError> {
    let jobs = job_repo::list_by_status(db, JobStatus::Dead, limit)?;
    Ok(jobs.into_iter().map(JobStatusView::from).collect())
}

/// Puts a DEAD job back in the queue with a clean slate. Any other status
/// is rejected and left untouched.
pub fn retry_dead_job(
    db: &Database,
    auditor: &Auditor,
    job_id: &str,
    actor_id: &str,
) -> Result<JobStatusView, JobError> {
    let before = job_repo::find_by_id(db, job_id)?
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

    let reset = match job_repo::reset_dead(db, job_id, Utc::now())? {
        Some(job) => job,
        None => {
            // re-read: the status may have changed since `before`
            let status = job_repo::find_by_id(db, job_id)?
                .map(|j| j.status)
                .unwrap_or(before.status);
            return Err(JobError::NotDead {
                id: job_id.to_string(),
                status,
            });
        }
    };

    log::info!("Job {} reset from DEAD by {}", job_id, actor_id);
    auditor.emit(
        AuditEvent::job(
            AuditAction::JOB_RETRIED_BY_ADMIN,
            job_id,
            json!({
                "documentId": reset.document_id,
                "previousAttempts": before.attempts,
                "previousError": before.error,
            }),
        )
        .with_actor(actor_id),
    );

    Ok(reset.into())
}

/// Stored chunks of a document, in order.
pub fn document_chunks(db: &Database, document_id: &str) -> Result<Vec<StoredChunk>, JobError> {
    if document_repo::find_by_id(db, document_id)?.is_none() {
        return Err(JobError::DocumentNotFound(document_id.to_string()));
    }
    Ok(chunk_repo::list_for_document(db, document_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> NewDocument {
        NewDocument {
            owner_id: "user-3".to_string(),
            title: "Contract".to_string(),
            file_name: "contract.pdf".to_string(),
            file_path: "/uploads/contract.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 2048,
        }
    }

    #[test]
    fn test_submit_creates_document_and_pending_job() {
        let db = Database::open_in_memory().unwrap();
        let submission = submit_upload(&db, &Auditor::tracing(), &upload(), 3).unwrap();

        assert_eq!(submission.job.status, JobStatus::Pending);
        assert_eq!(submission.job.attempts, 0);
        assert_eq!(submission.job.max_attempts, 3);
        assert_eq!(submission.job.document_id, submission.document.id);
        assert!(submission.job.next_run_at <= Utc::now());
    }

    #[test]
    fn test_status_view_field_names() {
        let db = Database::open_in_memory().unwrap();
        let submission = submit_upload(&db, &Auditor::tracing(), &upload(), 3).unwrap();

        let view = job_status(&db, &submission.job.job_id).unwrap();
        let value = serde_json::to_value(&view).unwrap();
        for key in [
            "jobId",
            "type",
            "status",
            "stage",
            "attempts",
            "maxAttempts",
            "nextRunAt",
            "documentId",
            "error",
            "createdAt",
            "updatedAt",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["type"], "DOCUMENT_PROCESSING");
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["stage"], "queued");
    }

    #[test]
    fn test_unknown_job() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(job_status(&db, "nope"), Err(JobError::NotFound(_))));
        assert!(matches!(
            retry_dead_job(&db, &Auditor::tracing(), "nope", "admin"),
            Err(JobError::NotFound(_))
        ));
    }

    #[test]
    fn test_retry_rejects_live_job() {
        let db = Database::open_in_memory().unwrap();
        let submission = submit_upload(&db, &Auditor::tracing(), &upload(), 3).unwrap();

        let err = retry_dead_job(&db, &Auditor::tracing(), &submission.job.job_id, "admin").unwrap_err();
        assert!(matches!(
            err,
            JobError::NotDead {
                status: JobStatus::Pending,
                ..
            }
        ));
        let unchanged = job_status(&db, &submission.job.job_id).unwrap();
        assert_eq!(unchanged.status, JobStatus::Pending);
    }

    #[test]
    fn test_create_job_for_missing_document() {
        let db = Database::open_in_memory().unwrap();
        let result = create_job(&db, "ghost", "/x.pdf", "application/pdf", 3);
        assert!(matches!(result, Err(JobError::DocumentNotFound(_))));
    }

    #[test]
    fn test_document_chunks_requires_document() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            document_chunks(&db, "ghost"),
            Err(JobError::DocumentNotFound(_))
        ));
        let submission = submit_upload(&db, &Auditor::tracing(), &upload(), 3).unwrap();
        assert!(document_chunks(&db, &submission.document.id).unwrap().is_empty());
    }
}
