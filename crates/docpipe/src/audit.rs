//! Best-effort audit trail.
//!
//! Events go through an [`Auditor`], which never lets a sink failure reach
//! the caller: the error is logged and the operation carries on.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::db::{audit_repo, Database, DatabaseError};

/// Action names written to the audit log.
pub struct AuditAction;

impl AuditAction {
    pub const DOCUMENT_UPLOADED: &'static str = "DOCUMENT_UPLOADED";
    pub const JOB_CREATED: &'static str = "JOB_CREATED";
    pub const JOB_STARTED: &'static str = "JOB_STARTED";
    pub const JOB_COMPLETED: &'static str = "JOB_COMPLETED";
    pub const JOB_RETRY_SCHEDULED: &'static str = "JOB_RETRY_SCHEDULED";
    pub const JOB_FAILED: &'static str = "JOB_FAILED";
    pub const JOB_RELEASED: &'static str = "JOB_RELEASED";
    pub const JOB_RECLAIMED: &'static str = "JOB_RECLAIMED";
    pub const JOB_RETRIED_BY_ADMIN: &'static str = "JOB_RETRIED_BY_ADMIN";
}

pub const RESOURCE_JOB: &str = "job";
pub const RESOURCE_DOCUMENT: &str = "document";

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub actor_id: Option<String>,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        resource_type: &str,
        resource_id: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            action: action.to_string(),
            actor_id: None,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.into(),
            metadata,
        }
    }

    pub fn job(action: &str, job_id: impl Into<String>, metadata: Value) -> Self {
        Self::new(action, RESOURCE_JOB, job_id, metadata)
    }

    pub fn document(action: &str, document_id: impl Into<String>, metadata: Value) -> Self {
        Self::new(action, RESOURCE_DOCUMENT, document_id, metadata)
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub actor_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    Store(#[from] DatabaseError),

    #[error("{0}")]
    Other(String),
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes events to the `audit_logs` table. Built from a path, it opens
/// the database on first use and again after losing it.
pub struct SqliteAuditSink {
    path: Option<PathBuf>,
    db: Mutex<Option<Database>>,
}

impl SqliteAuditSink {
    pub fn new(db: Database) -> Self {
        Self {
            path: None,
            db: Mutex::new(Some(db)),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            db: Mutex::new(None),
        }
    }

    fn handle(&self) -> Result<Database, AuditError> {
        let mut cached = self.db.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        if let Some(db) = cached.as_ref() {
            return Ok(db.clone());
        }
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| AuditError::Other("audit database is not configured".to_string()))?;
        let db = Database::open(path)?;
        *cached = Some(db.clone());
        Ok(db)
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let db = self.handle()?;
        match audit_repo::insert(&db, event, Utc::now()) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_connectivity() && self.path.is_some() {
                    if let Ok(mut cached) = self.db.lock() {
                        cached.take();
                    }
                }
                Err(e.into())
            }
        }
    }
}

/// Emits events as log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "docpipe::audit",
            action = %event.action,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            actor_id = event.actor_id.as_deref().unwrap_or("-"),
            metadata = %event.metadata,
            "audit"
        );
        Ok(())
    }
}

/// Fire-and-forget front for an [`AuditSink`].
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// An auditor that only logs.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    /// Delivers `event`. Failures are logged and dropped.
    pub fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.sink.record(&event) {
            log::warn!(
                "Failed to record audit event {} for {} {}: {}",
                event.action,
                event.resource_type,
                event.resource_id,
                e
            );
        }
    }
}
