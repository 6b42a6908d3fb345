//! One worker slot: reconnect, sweep, claim, execute, sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::json;

use crate::audit::{AuditAction, AuditEvent, Auditor};
use crate::config::WorkerConfig;
use crate::db::{job_repo, Database, DatabaseError};
use crate::jobs::{FailureDecision, JobType};
use crate::pipeline::{JobOutcome, Pipeline};

use super::connection::{ConnectionState, Connector};
use super::shutdown::ShutdownSignal;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// No store connection; nothing attempted.
    Disconnected,
    /// Connected, but no eligible job.
    Idle,
    Processed(JobOutcome),
}

/// Per-slot counters, summed by the pool at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub retried: u64,
    pub dead: u64,
    pub abandoned: u64,
    pub unrecorded: u64,
    pub released: u64,
    pub reclaimed: u64,
    pub reconnects: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.dead += other.dead;
        self.abandoned += other.abandoned;
        self.unrecorded += other.unrecorded;
        self.released += other.released;
        self.reclaimed += other.reclaimed;
        self.reconnects += other.reconnects;
    }

    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::RetryScheduled { .. } => self.retried += 1,
            JobOutcome::Dead { .. } => self.dead += 1,
            JobOutcome::Abandoned { .. } => self.abandoned += 1,
            JobOutcome::Unrecorded { .. } => self.unrecorded += 1,
            JobOutcome::Superseded => {}
        }
    }
}

fn instant_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Processes jobs of one type, one at a time, against its own store
/// connection.
pub struct IngestionWorker {
    slot: usize,
    job_type: JobType,
    config: WorkerConfig,
    pipeline: Arc<Pipeline>,
    connector: Arc<dyn Connector>,
    auditor: Auditor,
    state: ConnectionState,
    /// Job id and claim token of a run cut off when the store went away;
    /// released on reconnect.
    abandoned: Option<(String, String)>,
    last_sweep: Option<Instant>,
    stats: WorkerStats,
}

impl IngestionWorker {
    pub fn new(
        slot: usize,
        config: WorkerConfig,
        pipeline: Arc<Pipeline>,
        connector: Arc<dyn Connector>,
        auditor: Auditor,
    ) -> Self {
        Self {
            slot,
            job_type: JobType::DocumentProcessing,
            config,
            pipeline,
            connector,
            auditor,
            state: ConnectionState::default(),
            abandoned: None,
            last_sweep: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Polls until shutdown. The job in flight when shutdown arrives runs
    /// to its end; no new claim is made afterwards.
    pub fn run(mut self, shutdown: ShutdownSignal) -> WorkerStats {
        debug!("Worker slot {} started", self.slot);

        while !shutdown.is_triggered() {
            let pause = match self.tick() {
                Tick::Disconnected => self.config.reconnect_interval(),
                Tick::Idle | Tick::Processed(_) => self.config.poll_interval(),
            };
            if shutdown.wait(pause) {
                break;
            }
        }

        if self.abandoned.is_some() {
            // one last chance to hand the job back before exiting
            self.state.try_connect(self.connector.as_ref(), Duration::ZERO);
            if let Some(db) = self.state.database().cloned() {
                self.release_abandoned(&db);
            }
            if let Some((job_id, _)) = &self.abandoned {
                warn!(
                    "Slot {} exiting with job {} still PROCESSING; the liveness sweep will recover it",
                    self.slot, job_id
                );
            }
        }

        debug!("Worker slot {} stopped", self.slot);
        self.stats
    }

    /// One iteration of the polling loop.
    pub fn tick(&mut self) -> Tick {
        if !self.state.is_connected() {
            if self
                .state
                .try_connect(self.connector.as_ref(), self.config.reconnect_interval())
            {
                self.stats.reconnects += 1;
            } else {
                return Tick::Disconnected;
            }
        }
        let db = match self.state.database() {
            Some(db) => db.clone(),
            None => return Tick::Disconnected,
        };

        if !self.release_abandoned(&db) {
            return Tick::Disconnected;
        }

        if self.sweep_due() {
            if let Err(e) = self.sweep(&db) {
                if e.is_connectivity() {
                    self.state.disconnect(&e);
                    return Tick::Disconnected;
                }
                error!("Liveness sweep failed: {}", e);
            }
        }

        let job = match job_repo::claim_next(&db, self.job_type, Utc::now()) {
            Ok(Some(job)) => job,
            Ok(None) => return Tick::Idle,
            Err(e) if e.is_connectivity() => {
                self.state.disconnect(&e);
                return Tick::Disconnected;
            }
            Err(e) => {
                error!("Failed to claim job: {}", e);
                return Tick::Idle;
            }
        };

        info!("Slot {} claimed job {}", self.slot, job.id);
        let claim = job.claim_token.clone().map(|token| (job.id.clone(), token));
        let outcome = self.pipeline.process(&db, job);
        self.stats.record(&outcome);

        if let JobOutcome::Abandoned { error } = &outcome {
            self.abandoned = claim;
            self.state.disconnect(error);
        }

        Tick::Processed(outcome)
    }

    /// Returns `false` if the store is unreachable again.
    fn release_abandoned(&mut self, db: &Database) -> bool {
        let Some((job_id, claim_token)) = self.abandoned.take() else {
            return true;
        };

        match job_repo::release(db, &job_id, &claim_token, Utc::now()) {
            Ok(true) => {
                info!("Released interrupted job {} back to the queue", job_id);
                self.stats.released += 1;
                self.auditor.emit(AuditEvent::job(
                    AuditAction::JOB_RELEASED,
                    &job_id,
                    json!({ "reason": "store connection lost mid-run" }),
                ));
                true
            }
            Ok(false) => {
                debug!("Interrupted job {} was already settled or reclaimed", job_id);
                true
            }
            Err(e) if e.is_connectivity() => {
                self.abandoned = Some((job_id, claim_token));
                self.state.disconnect(&e);
                false
            }
            Err(e) => {
                error!("Failed to release job {}: {}", job_id, e);
                true
            }
        }
    }

    fn sweep_due(&self) -> bool {
        self.last_sweep
            .map_or(true, |at| at.elapsed() >= self.config.sweep_interval())
    }

    /// Treats long-silent PROCESSING jobs as one failed attempt each.
    fn sweep(&mut self, db: &Database) -> Result<(), DatabaseError> {
        self.last_sweep = Some(Instant::now());
        let now = Utc::now();
        let stale_before = instant_before(now, self.config.liveness_timeout());

        let reclaimed = job_repo::reclaim_stale(db, stale_before, &self.pipeline.config().retry, now)?;
        for (job, decision) in reclaimed {
            self.stats.reclaimed += 1;
            let outcome = match decision {
                FailureDecision::Retry { .. } => "retry",
                FailureDecision::Dead { .. } => "dead",
            };
            warn!(
                "Reclaimed stale job {} (attempts {}/{}, {})",
                job.id, job.attempts, job.max_attempts, outcome
            );
            self.auditor.emit(AuditEvent::job(
                AuditAction::JOB_RECLAIMED,
                &job.id,
                json!({
                    "documentId": job.document_id,
                    "attempts": job.attempts,
                    "outcome": outcome,
                    "error": job.error,
                }),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::WhitespaceTokenCounter;
    use crate::db::document_repo;
    use crate::document::NewDocument;
    use crate::extraction::{Extraction, ExtractionError, Extractor};
    use crate::jobs::{JobStatus, NewJob};
    use crate::pipeline::PipelineConfig;
    use crate::worker::connection::SqliteConnector;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticExtractor;

    impl Extractor for StaticExtractor {
        fn extract(&self, _path: &Path, _mime: &str) -> Result<Extraction, ExtractionError> {
            Ok(Extraction {
                text: "A perfectly ordinary paragraph of extracted text.".to_string(),
                page_count: 1,
            })
        }
    }

    struct JammedExtractor;

    impl Extractor for JammedExtractor {
        fn extract(&self, _path: &Path, _mime: &str) -> Result<Extraction, ExtractionError> {
            Err(ExtractionError::Pdf("scanner jammed".to_string()))
        }
    }

    /// Fails every connect while `down` is set.
    struct SwitchableConnector {
        inner: SqliteConnector,
        down: AtomicBool,
    }

    impl Connector for SwitchableConnector {
        fn connect(&self) -> Result<Database, DatabaseError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DatabaseError::Io {
                    path: "offline".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotConnected, "offline"),
                });
            }
            self.inner.connect()
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval_ms: 10,
            reconnect_interval_ms: 1,
            liveness_timeout_secs: 600,
            sweep_interval_secs: 60,
            slots: 1,
        }
    }

    fn worker(connector: Arc<dyn Connector>) -> IngestionWorker {
        worker_with(connector, Arc::new(StaticExtractor))
    }

    fn worker_with(connector: Arc<dyn Connector>, extractor: Arc<dyn Extractor>) -> IngestionWorker {
        let pipeline = Pipeline::new(
            Arc::new(PipelineConfig::default()),
            extractor,
            Arc::new(WhitespaceTokenCounter),
            Auditor::tracing(),
        );
        IngestionWorker::new(0, fast_config(), Arc::new(pipeline), connector, Auditor::tracing())
    }

    fn enqueue(db: &Database) -> String {
        let doc = document_repo::create(
            db,
            &NewDocument {
                owner_id: "u".to_string(),
                title: "t".to_string(),
                file_name: "a.pdf".to_string(),
                file_path: "/a.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                size_bytes: 1,
            },
            Utc::now(),
        )
        .unwrap();
        job_repo::create(
            db,
            &NewJob::document_processing(&doc.id, "/a.pdf", "application/pdf", 3),
            Utc::now(),
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_tick_processes_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let db = Database::open(&path).unwrap();
        let first = enqueue(&db);
        let second = enqueue(&db);

        let mut worker = worker(Arc::new(SqliteConnector::new(&path)));
        assert!(matches!(
            worker.tick(),
            Tick::Processed(JobOutcome::Completed { chunk_count: 1, .. })
        ));

        let first = job_repo::find_by_id(&db, &first).unwrap().unwrap();
        let second = job_repo::find_by_id(&db, &second).unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(second.status, JobStatus::Pending);
        assert_eq!(worker.stats().completed, 1);
    }

    #[test]
    fn test_idle_when_queue_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let mut worker = worker(Arc::new(SqliteConnector::new(&path)));
        assert_eq!(worker.tick(), Tick::Idle);
        assert!(worker.is_connected());
    }

    #[test]
    fn test_suspends_while_store_down_and_releases_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let db = Database::open(&path).unwrap();
        let job_id = enqueue(&db);
        let claimed = job_repo::claim_next(&db, JobType::DocumentProcessing, Utc::now())
            .unwrap()
            .unwrap();

        let connector = Arc::new(SwitchableConnector {
            inner: SqliteConnector::new(&path),
            down: AtomicBool::new(true),
        });
        let mut worker = worker(connector.clone());
        worker.abandoned = Some((job_id.clone(), claimed.claim_token.unwrap()));

        assert_eq!(worker.tick(), Tick::Disconnected);
        assert_eq!(worker.tick(), Tick::Disconnected);
        let still = job_repo::find_by_id(&db, &job_id).unwrap().unwrap();
        assert_eq!(still.status, JobStatus::Processing);

        connector.down.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));

        // reconnect, release, then the released job is claimed and run
        let tick = worker.tick();
        assert!(matches!(tick, Tick::Processed(JobOutcome::Completed { .. })), "{:?}", tick);
        let job = job_repo::find_by_id(&db, &job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 0);
        assert_eq!(worker.stats().released, 1);
        assert_eq!(worker.stats().reconnects, 1);
    }

    #[test]
    fn test_unrecorded_failure_keeps_worker_connected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let db = Database::open(&path).unwrap();
        let job_id = enqueue(&db);
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER freeze_attempts BEFORE UPDATE OF attempts ON jobs
                 BEGIN SELECT RAISE(ABORT, 'attempts are frozen'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let mut worker = worker_with(
            Arc::new(SqliteConnector::new(&path)),
            Arc::new(JammedExtractor),
        );
        let tick = worker.tick();
        assert!(matches!(tick, Tick::Processed(JobOutcome::Unrecorded { .. })), "{:?}", tick);
        assert!(worker.is_connected());
        assert!(worker.abandoned.is_none());
        assert_eq!(worker.stats().unrecorded, 1);
        assert_eq!(worker.stats().abandoned, 0);

        // left PROCESSING for the liveness sweep
        let job = job_repo::find_by_id(&db, &job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 0);
        assert_eq!(worker.tick(), Tick::Idle);
    }

    #[test]
    fn test_sweep_reclaims_stale_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let db = Database::open(&path).unwrap();
        let job_id = enqueue(&db);
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let claimed = job_repo::claim_next(&db, JobType::DocumentProcessing, Utc::now())
            .unwrap()
            .unwrap();
        let token = claimed.claim_token.unwrap();
        job_repo::set_stage(&db, &job_id, &token, crate::jobs::JobStage::Extraction, long_ago)
            .unwrap();

        let mut worker = worker(Arc::new(SqliteConnector::new(&path)));
        // the reclaimed job is backed off, so nothing is claimable yet
        assert_eq!(worker.tick(), Tick::Idle);

        let job = job_repo::find_by_id(&db, &job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.error.unwrap().starts_with("lease expired"));
        assert_eq!(worker.stats().reclaimed, 1);
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let worker = worker(Arc::new(SqliteConnector::new(&path)));
        let (trigger, signal) = crate::worker::shutdown_channel();

        let handle = std::thread::spawn(move || worker.run(signal));
        std::thread::sleep(Duration::from_millis(50));
        trigger.trigger();
        let stats = handle.join().unwrap();
        assert_eq!(stats.completed, 0);
    }
}
