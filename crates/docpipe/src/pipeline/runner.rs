use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, info_span, warn};

use crate::audit::{AuditAction, AuditEvent, Auditor};
use crate::chunking::{chunk_text, TokenCounter};
use crate::db::{chunk_repo, document_repo, job_repo, text_repo, Database};
use crate::document::Document;
use crate::error::PipelineError;
use crate::extraction::{is_supported_media_type, Extractor};
use crate::jobs::{FailureDecision, Job, JobStage};

use super::config::PipelineConfig;
use super::context::PipelineContext;

/// How one execution of a claimed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        page_count: u32,
        chunk_count: u32,
    },
    RetryScheduled {
        attempts: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        attempts: u32,
        error: String,
    },
    /// The store became unreachable mid-run. The job is still PROCESSING
    /// and must be released once the worker reconnects.
    Abandoned { error: String },
    /// The failure could not be written for a reason other than
    /// connectivity. The job stays PROCESSING until the liveness sweep
    /// counts the attempt.
    Unrecorded { error: String },
    /// The claim no longer holds the job (settled, or reclaimed and
    /// claimed again); nothing was recorded.
    Superseded,
}

/// Drives one document job from claim to completion or failure.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    extractor: Arc<dyn Extractor>,
    counter: Arc<dyn TokenCounter>,
    auditor: Auditor,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        extractor: Arc<dyn Extractor>,
        counter: Arc<dyn TokenCounter>,
        auditor: Auditor,
    ) -> Self {
        Self {
            config,
            extractor,
            counter,
            auditor,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Executes a job already claimed (PROCESSING) by the caller.
    ///
    /// Every failure in the steps is caught here, exactly once, and turned
    /// into a retry or a dead-letter. Loss of the store is the exception:
    /// it is reported as [`JobOutcome::Abandoned`] without touching the
    /// attempt count.
    pub fn process(&self, db: &Database, job: Job) -> JobOutcome {
        let _pipeline_span = info_span!("pipeline",
            job_id = %job.id,
            document_id = %job.document_id,
            attempt = job.attempts + 1,
        )
        .entered();

        let Some(claim_token) = job.claim_token.clone() else {
            warn!("Job {} was not claimed, refusing to run it", job.id);
            return JobOutcome::Superseded;
        };

        self.auditor.emit(AuditEvent::job(
            AuditAction::JOB_STARTED,
            &job.id,
            json!({
                "documentId": job.document_id,
                "attempt": job.attempts + 1,
                "maxAttempts": job.max_attempts,
            }),
        ));

        let mut ctx = PipelineContext::new(job);
        match self.run(db, &mut ctx, &claim_token) {
            Ok(()) => {
                info!(
                    "Job completed: {} pages, {} chunks",
                    ctx.page_count(),
                    ctx.chunk_count()
                );
                self.auditor.emit(AuditEvent::job(
                    AuditAction::JOB_COMPLETED,
                    &ctx.job.id,
                    json!({
                        "documentId": ctx.job.document_id,
                        "pageCount": ctx.page_count(),
                        "chunkCount": ctx.chunk_count(),
                    }),
                ));
                JobOutcome::Completed {
                    page_count: ctx.page_count(),
                    chunk_count: ctx.chunk_count(),
                }
            }
            Err(PipelineError::LeaseLost(id)) => {
                warn!("Job {} was settled elsewhere while running, dropping result", id);
                JobOutcome::Superseded
            }
            Err(e) if e.is_connectivity() => {
                warn!("Store unreachable mid-job, abandoning: {}", e);
                JobOutcome::Abandoned {
                    error: e.to_string(),
                }
            }
            Err(e) => self.fail(db, &ctx.job, &claim_token, &e),
        }
    }

    fn run(
        &self,
        db: &Database,
        ctx: &mut PipelineContext,
        claim_token: &str,
    ) -> Result<(), PipelineError> {
        // Step 1+2: Load document, check media type
        let document = {
            let _step = info_span!("load_document").entered();
            let document = self.step_load_document(db, &ctx.job)?;
            ctx.document = Some(document.clone());
            document
        };

        // Step 3: Extract text
        let extraction = {
            let _step = info_span!("extract").entered();
            self.advance(db, &ctx.job, claim_token, JobStage::Extraction)?;
            self.step_extract(&document)?
        };

        // Step 4: Cache extracted text
        {
            let _step = info_span!("store_text").entered();
            text_repo::upsert(
                db,
                &document.id,
                &extraction.text,
                extraction.page_count,
                Utc::now(),
            )?;
        }

        // Step 5: Chunk
        {
            let _step = info_span!("chunk").entered();
            self.advance(db, &ctx.job, claim_token, JobStage::Chunking)?;
            ctx.chunks = chunk_text(&extraction.text, &self.config.chunking, self.counter.as_ref());
            if ctx.chunks.is_empty() {
                return Err(PipelineError::ChunkingProducedNothing);
            }
            debug!(
                "Produced {} chunks with the {} counter",
                ctx.chunks.len(),
                self.counter.name()
            );
        }
        ctx.extraction = Some(extraction);

        // Step 6+7: Replace chunks and activate the document together
        {
            let _step = info_span!("persist").entered();
            self.advance(db, &ctx.job, claim_token, JobStage::Persisting)?;
            let page_count = ctx.page_count();
            let chunk_count = ctx.chunk_count();
            let chunks = &ctx.chunks;
            let job_id = &ctx.job.id;
            db.with_tx(|tx| -> Result<(), PipelineError> {
                if !job_repo::holds_claim_in(tx, job_id, claim_token)? {
                    return Err(PipelineError::LeaseLost(job_id.clone()));
                }
                chunk_repo::replace_in(tx, &document.id, chunks, Utc::now())?;
                document_repo::mark_active_in(tx, &document.id, page_count, chunk_count, Utc::now())?;
                Ok(())
            })?;
        }

        // Step 8: Complete the job
        if !job_repo::complete(db, &ctx.job.id, claim_token, Utc::now())? {
            return Err(PipelineError::LeaseLost(ctx.job.id.clone()));
        }

        Ok(())
    }

    fn step_load_document(&self, db: &Database, job: &Job) -> Result<Document, PipelineError> {
        let document = document_repo::find_by_id(db, &job.document_id)?
            .ok_or_else(|| PipelineError::DocumentNotFound(job.document_id.clone()))?;

        if !is_supported_media_type(&document.mime_type) {
            return Err(PipelineError::UnsupportedMediaType(document.mime_type.clone()));
        }

        if document_repo::mark_processing(db, &document.id, Utc::now())? {
            debug!("Document {} is now processing", document.id);
        }

        Ok(document)
    }

    fn step_extract(&self, document: &Document) -> Result<crate::extraction::Extraction, PipelineError> {
        let extraction = self
            .extractor
            .extract(Path::new(&document.file_path), &document.mime_type)?;

        let length = extraction.text.trim().chars().count();
        if length == 0 {
            return Err(PipelineError::ExtractionFailed(
                "extractor returned no text".to_string(),
            ));
        }
        if length < self.config.min_text_length {
            return Err(PipelineError::ExtractionFailed(format!(
                "extracted text too short: {} characters (minimum {})",
                length, self.config.min_text_length
            )));
        }

        debug!(
            "Extracted {} characters from {} pages",
            length, extraction.page_count
        );
        Ok(extraction)
    }

    /// Persists the stage, which doubles as the liveness heartbeat.
    fn advance(
        &self,
        db: &Database,
        job: &Job,
        claim_token: &str,
        stage: JobStage,
    ) -> Result<(), PipelineError> {
        if job_repo::set_stage(db, &job.id, claim_token, stage, Utc::now())? {
            Ok(())
        } else {
            Err(PipelineError::LeaseLost(job.id.clone()))
        }
    }

    fn fail(&self, db: &Database, job: &Job, claim_token: &str, error: &PipelineError) -> JobOutcome {
        let message = error.to_string();
        warn!("Job attempt failed: {}", message);

        let recorded = job_repo::record_failure(
            db,
            &job.id,
            claim_token,
            &message,
            &self.config.retry,
            Utc::now(),
        );

        match recorded {
            Ok(Some((updated, FailureDecision::Retry { attempts, delay }))) => {
                info!(
                    "Retry {} of {} scheduled in {:?}",
                    attempts, updated.max_attempts, delay
                );
                self.auditor.emit(AuditEvent::job(
                    AuditAction::JOB_RETRY_SCHEDULED,
                    &job.id,
                    json!({
                        "documentId": job.document_id,
                        "attempts": attempts,
                        "delayMs": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "nextRunAt": updated.next_run_at,
                        "error": message,
                    }),
                ));
                JobOutcome::RetryScheduled {
                    attempts,
                    next_run_at: updated.next_run_at,
                    error: message,
                }
            }
            Ok(Some((_, FailureDecision::Dead { attempts }))) => {
                warn!("Job dead after {} attempts: {}", attempts, message);
                self.auditor.emit(AuditEvent::job(
                    AuditAction::JOB_FAILED,
                    &job.id,
                    json!({
                        "documentId": job.document_id,
                        "attempts": attempts,
                        "error": message,
                    }),
                ));
                JobOutcome::Dead {
                    attempts,
                    error: message,
                }
            }
            Ok(None) => JobOutcome::Superseded,
            Err(e) if e.is_connectivity() => {
                // still PROCESSING; released after reconnect
                warn!("Store unreachable while recording failure: {}", e);
                JobOutcome::Abandoned {
                    error: format!("{} (failure not recorded: {})", message, e),
                }
            }
            Err(e) => {
                // still PROCESSING; the liveness sweep will count the attempt
                log::error!("Failed to record failure for job {}: {}", job.id, e);
                JobOutcome::Unrecorded {
                    error: format!("{} (failure not recorded: {})", message, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, AuditSink};
    use crate::chunking::WhitespaceTokenCounter;
    use crate::document::{DocumentStatus, NewDocument};
    use crate::extraction::{Extraction, ExtractionError};
    use crate::jobs::{JobStatus, JobType, NewJob};
    use std::sync::Mutex;

    struct FixedExtractor(Result<Extraction, String>);

    impl Extractor for FixedExtractor {
        fn extract(&self, _path: &Path, _mime: &str) -> Result<Extraction, ExtractionError> {
            self.0.clone().map_err(ExtractionError::Other)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        actions: Mutex<Vec<String>>,
    }

    impl AuditSink for RecordingSink {
        fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
            self.actions.lock().unwrap().push(event.action.clone());
            Ok(())
        }
    }

    fn pipeline(extraction: Result<Extraction, String>, sink: Arc<RecordingSink>) -> Pipeline {
        Pipeline::new(
            Arc::new(PipelineConfig::default()),
            Arc::new(FixedExtractor(extraction)),
            Arc::new(WhitespaceTokenCounter),
            Auditor::new(sink),
        )
    }

    fn claimed_job(db: &Database, mime_type: &str) -> Job {
        let doc = document_repo::create(
            db,
            &NewDocument {
                owner_id: "user-1".to_string(),
                title: "Manual".to_string(),
                file_name: "manual.pdf".to_string(),
                file_path: "/uploads/manual.pdf".to_string(),
                mime_type: mime_type.to_string(),
                size_bytes: 10,
            },
            Utc::now(),
        )
        .unwrap();
        job_repo::create(
            db,
            &NewJob::document_processing(&doc.id, &doc.file_path, mime_type, 3),
            Utc::now(),
        )
        .unwrap();
        job_repo::claim_next(db, JobType::DocumentProcessing, Utc::now())
            .unwrap()
            .unwrap()
    }

    fn text(words: usize) -> String {
        (0..words).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_successful_run() {
        let db = Database::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let job = claimed_job(&db, "application/pdf");
        let pipeline = pipeline(
            Ok(Extraction {
                text: text(50),
                page_count: 2,
            }),
            sink.clone(),
        );

        let outcome = pipeline.process(&db, job.clone());
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                page_count: 2,
                chunk_count: 1
            }
        );

        let stored = job_repo::find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let doc = document_repo::find_by_id(&db, &job.document_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Active);
        assert_eq!(doc.page_count, 2);
        assert_eq!(doc.chunk_count, 1);
        assert_eq!(
            *sink.actions.lock().unwrap(),
            vec![AuditAction::JOB_STARTED, AuditAction::JOB_COMPLETED]
        );
    }

    #[test]
    fn test_short_text_schedules_retry() {
        let db = Database::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let job = claimed_job(&db, "application/pdf");
        let pipeline = pipeline(
            Ok(Extraction {
                text: "0123456789".to_string(),
                page_count: 1,
            }),
            sink.clone(),
        );

        match pipeline.process(&db, job.clone()) {
            JobOutcome::RetryScheduled { attempts, error, .. } => {
                assert_eq!(attempts, 1);
                assert!(error.contains("Extraction failed"), "{}", error);
            }
            other => panic!("expected retry, got {:?}", other),
        }
        let doc = document_repo::find_by_id(&db, &job.document_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);
        assert_eq!(
            sink.actions.lock().unwrap().last().map(String::as_str),
            Some(AuditAction::JOB_RETRY_SCHEDULED)
        );
    }

    #[test]
    fn test_unsupported_media_type_fails_before_extraction() {
        let db = Database::open_in_memory().unwrap();
        let job = claimed_job(&db, "text/plain");
        let pipeline = pipeline(Err("must not be called".to_string()), Arc::default());

        match pipeline.process(&db, job.clone()) {
            JobOutcome::RetryScheduled { error, .. } => {
                assert!(error.contains("Unsupported media type: text/plain"));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        let doc = document_repo::find_by_id(&db, &job.document_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Uploaded);
    }

    #[test]
    fn test_unclaimed_job_is_superseded() {
        let db = Database::open_in_memory().unwrap();
        let job = claimed_job(&db, "application/pdf");
        let token = job.claim_token.clone().unwrap();
        job_repo::release(&db, &job.id, &token, Utc::now()).unwrap();

        let pipeline = pipeline(
            Ok(Extraction {
                text: text(30),
                page_count: 1,
            }),
            Arc::default(),
        );
        assert_eq!(pipeline.process(&db, job.clone()), JobOutcome::Superseded);
        assert_eq!(
            job_repo::find_by_id(&db, &job.id).unwrap().unwrap().attempts,
            0
        );
    }

    #[test]
    fn test_job_without_claim_token_is_not_run() {
        let db = Database::open_in_memory().unwrap();
        let claimed = claimed_job(&db, "application/pdf");
        let mut unclaimed = claimed.clone();
        unclaimed.claim_token = None;

        let pipeline = pipeline(Err("must not be called".to_string()), Arc::default());
        assert_eq!(pipeline.process(&db, unclaimed), JobOutcome::Superseded);

        let stored = job_repo::find_by_id(&db, &claimed.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.stage, JobStage::Initializing);
    }

    #[test]
    fn test_unwritable_failure_is_left_for_the_sweep() {
        let db = Database::open_in_memory().unwrap();
        let job = claimed_job(&db, "application/pdf");
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER freeze_attempts BEFORE UPDATE OF attempts ON jobs
                 BEGIN SELECT RAISE(ABORT, 'attempts are frozen'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let pipeline = pipeline(Err("scanner jammed".to_string()), Arc::default());
        match pipeline.process(&db, job.clone()) {
            JobOutcome::Unrecorded { error } => {
                assert!(error.contains("scanner jammed"), "{}", error);
                assert!(error.contains("attempts are frozen"), "{}", error);
            }
            other => panic!("expected an unrecorded failure, got {:?}", other),
        }

        let stored = job_repo::find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 0);
    }
}
