//! Test harness for isolated pipeline and worker tests.
//!
//! Each `TestHarness` owns a temporary directory with a file-backed job
//! store, so separate connections (workers, threads) can share it the way
//! separate processes would.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use docpipe::audit::{AuditSink, Auditor};
use docpipe::chunking::WhitespaceTokenCounter;
use docpipe::config::WorkerConfig;
use docpipe::db::{job_repo, Database};
use docpipe::document::{Document, NewDocument};
use docpipe::extraction::Extractor;
use docpipe::jobs::{Job, JobType};
use docpipe::pipeline::{Pipeline, PipelineConfig};
use docpipe::service::{self, Submission};
use docpipe::worker::{IngestionWorker, SqliteConnector};

use super::builders::RecordingSink;

pub const MAX_ATTEMPTS: u32 = 3;

pub struct TestHarness {
    temp_dir: TempDir,
    /// Path of the SQLite job store.
    pub db_path: PathBuf,
    /// The harness's own connection, used for setup and assertions.
    pub db: Database,
    /// Every audit event emitted through [`TestHarness::auditor`].
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("docpipe.db");
        let db = Database::open(&db_path).expect("Failed to open database");
        Self {
            temp_dir,
            db_path,
            db,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    /// A second, independent connection to the same store.
    pub fn connect(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to open second connection")
    }

    pub fn auditor(&self) -> Auditor {
        Auditor::new(self.sink.clone())
    }

    /// Accepts an upload of `file_name` as `mime_type` and queues its job.
    pub fn submit(&self, file_name: &str, mime_type: &str) -> Submission {
        let upload = NewDocument {
            owner_id: "user-42".to_string(),
            title: file_name.to_string(),
            file_name: file_name.to_string(),
            file_path: self
                .temp_dir
                .path()
                .join(file_name)
                .to_string_lossy()
                .into_owned(),
            mime_type: mime_type.to_string(),
            size_bytes: 1024,
        };
        service::submit_upload(&self.db, &self.auditor(), &upload, MAX_ATTEMPTS)
            .expect("Failed to submit upload")
    }

    pub fn submit_pdf(&self, file_name: &str) -> Submission {
        self.submit(file_name, "application/pdf")
    }

    pub fn pipeline(&self, extractor: Arc<dyn Extractor>) -> Pipeline {
        self.pipeline_with(PipelineConfig::default(), extractor)
    }

    pub fn pipeline_with(&self, config: PipelineConfig, extractor: Arc<dyn Extractor>) -> Pipeline {
        Pipeline::new(
            Arc::new(config),
            extractor,
            Arc::new(WhitespaceTokenCounter),
            self.auditor(),
        )
    }

    /// A pipeline that audits into `sink` instead of the harness recorder.
    pub fn pipeline_auditing_to(
        &self,
        sink: Arc<dyn AuditSink>,
        extractor: Arc<dyn Extractor>,
    ) -> Pipeline {
        Pipeline::new(
            Arc::new(PipelineConfig::default()),
            extractor,
            Arc::new(WhitespaceTokenCounter),
            Auditor::new(sink),
        )
    }

    /// A single worker slot on its own connection, polling fast.
    pub fn worker(&self, pipeline: Pipeline) -> IngestionWorker {
        IngestionWorker::new(
            0,
            fast_worker_config(),
            Arc::new(pipeline),
            Arc::new(SqliteConnector::new(&self.db_path)),
            self.auditor(),
        )
    }

    pub fn claim(&self) -> Option<Job> {
        self.claim_at(Utc::now())
    }

    /// Claims as if the clock read `now`; lets tests skip backoff waits.
    pub fn claim_at(&self, now: DateTime<Utc>) -> Option<Job> {
        job_repo::claim_next(&self.db, JobType::DocumentProcessing, now)
            .expect("Failed to claim job")
    }

    pub fn job(&self, id: &str) -> Job {
        job_repo::find_by_id(&self.db, id)
            .expect("Failed to load job")
            .expect("Job not found")
    }

    pub fn document(&self, id: &str) -> Document {
        docpipe::db::document_repo::find_by_id(&self.db, id)
            .expect("Failed to load document")
            .expect("Document not found")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: 10,
        reconnect_interval_ms: 1,
        liveness_timeout_secs: 600,
        sweep_interval_secs: 60,
        slots: 1,
    }
}
