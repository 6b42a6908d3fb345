pub mod audit;
pub mod chunking;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod extraction;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod service;
pub mod worker;

pub use audit::{AuditAction, AuditEvent, AuditSink, Auditor, SqliteAuditSink, TracingAuditSink};
pub use chunking::{chunk_text, ChunkingOptions, TextChunk, TokenCounter, WhitespaceTokenCounter};
pub use config::{load_config, load_config_or_default, Config};
pub use db::{Database, DatabaseError};
pub use document::{Document, DocumentStatus, NewDocument};
pub use error::{ConfigError, DocpipeError, JobError, PipelineError, Result, WorkerError};
pub use extraction::{Extraction, ExtractionError, Extractor, PdfExtractor};
pub use jobs::{Job, JobPayload, JobStage, JobStatus, JobType, RetryPolicy};
pub use pipeline::{JobOutcome, Pipeline, PipelineConfig};
pub use service::JobStatusView;
pub use worker::{IngestionWorker, SqliteConnector, WorkerPool};
