//! Job repository: creation, atomic claiming and state transitions for
//! the `jobs` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::jobs::{FailureDecision, Job, JobPayload, JobStage, JobStatus, JobType, NewJob, RetryPolicy};

use super::{format_ts, parse_ts, Database, DatabaseError};

const JOB_COLUMNS: &str = "id, job_type, status, stage, document_id, attempts, max_attempts, \
                           next_run_at, error, payload, claim_token, created_at, updated_at";

/// A job row exactly as stored, before decoding into [`Job`].
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    stage: String,
    document_id: String,
    attempts: u32,
    max_attempts: u32,
    next_run_at: String,
    error: Option<String>,
    payload: String,
    claim_token: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            stage: row.get("stage")?,
            document_id: row.get("document_id")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            next_run_at: row.get("next_run_at")?,
            error: row.get("error")?,
            payload: row.get("payload")?,
            claim_token: row.get("claim_token")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<Job, DatabaseError> {
        let decode = |column: &'static str, reason: String| DatabaseError::Decode {
            id: self.id.clone(),
            column,
            reason,
        };
        let job_type: JobType = self
            .job_type
            .parse()
            .map_err(|e: crate::jobs::ParseEnumError| decode("job_type", e.to_string()))?;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: crate::jobs::ParseEnumError| decode("status", e.to_string()))?;
        let stage: JobStage = self
            .stage
            .parse()
            .map_err(|e: crate::jobs::ParseEnumError| decode("stage", e.to_string()))?;
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .map_err(|e| decode("payload", e.to_string()))?;
        if payload.job_type() != job_type {
            return Err(decode(
                "payload",
                format!("payload is {} but job is {}", payload.job_type(), job_type),
            ));
        }

        Ok(Job {
            next_run_at: parse_ts(&self.id, "next_run_at", &self.next_run_at)?,
            created_at: parse_ts(&self.id, "created_at", &self.created_at)?,
            updated_at: parse_ts(&self.id, "updated_at", &self.updated_at)?,
            id: self.id,
            job_type,
            status,
            stage,
            document_id: self.document_id,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error: self.error,
            payload,
            claim_token: self.claim_token,
        })
    }
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Job>, DatabaseError> {
    let row = conn.query_row(sql, params, JobRow::from_row).optional()?;
    row.map(JobRow::into_job).transpose()
}

fn query_many(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::into_job).collect()
}

/// `now + delay`, clamped to the largest representable instant.
fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Inserts a `PENDING` job with zero attempts, eligible immediately.
/// `max_attempts` below 1 is raised to 1, so every dead job has used
/// exactly its allowance. Takes a bare connection so it can join a
/// caller's transaction.
pub fn insert_in(conn: &Connection, new_job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&new_job.payload).map_err(|e| DatabaseError::Decode {
        id: id.clone(),
        column: "payload",
        reason: e.to_string(),
    })?;
    let ts = format_ts(now);
    let max_attempts = new_job.max_attempts.max(1);
    if max_attempts != new_job.max_attempts {
        log::warn!("Job {} requested max_attempts 0, using 1", id);
    }

    conn.execute(
        "INSERT INTO jobs (id, job_type, status, stage, document_id, attempts, max_attempts,
         next_run_at, error, payload, created_at, updated_at)
         VALUES (?1, ?2, 'PENDING', 'queued', ?3, 0, ?4, ?5, NULL, ?6, ?5, ?5)",
        params![
            id,
            new_job.payload.job_type().as_str(),
            new_job.document_id,
            max_attempts,
            ts,
            payload,
        ],
    )?;

    query_one(
        conn,
        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
        params![id],
    )?
    .ok_or(DatabaseError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

/// Creates a job in its own statement.
pub fn create(db: &Database, new_job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
    db.with_conn(|conn| insert_in(conn, new_job, now))
}

/// Finds a job by its ID, always reading the latest persisted state.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| {
        query_one(
            conn,
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
        )
    })
}

/// Atomically claims the oldest eligible `PENDING` job of `job_type`.
///
/// Selection and the `PENDING -> PROCESSING` transition happen in one
/// statement, so when several workers race for the same row exactly one
/// gets it back; the others see `None` (a lost race, not an error).
///
/// The returned job carries a fresh `claim_token`. Writes for this run are
/// accepted only while the row still holds that token, so a run whose job
/// was reclaimed and claimed again can no longer touch it.
pub fn claim_next(
    db: &Database,
    job_type: JobType,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let ts = format_ts(now);
    let token = uuid::Uuid::new_v4().to_string();
    db.with_conn(|conn| {
        query_one(
            conn,
            &format!(
                "UPDATE jobs SET status = 'PROCESSING', stage = 'initializing', claim_token = ?3,
                 updated_at = ?2
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE job_type = ?1 AND status = 'PENDING' AND next_run_at <= ?2
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1
                 )
                 AND status = 'PENDING'
                 RETURNING {}",
                JOB_COLUMNS
            ),
            params![job_type.as_str(), ts, token],
        )
    })
}

/// Whether the claim identified by `claim_token` still holds job `id`.
/// Takes a bare connection so callers can check inside their own
/// transaction before writing derived data.
pub fn holds_claim_in(conn: &Connection, id: &str, claim_token: &str) -> Result<bool, DatabaseError> {
    let held = conn
        .query_row(
            "SELECT 1 FROM jobs WHERE id = ?1 AND status = 'PROCESSING' AND claim_token = ?2",
            params![id, claim_token],
            |_| Ok(()),
        )
        .optional()?;
    Ok(held.is_some())
}

/// Records progress on a running job. Also refreshes `updated_at`, which
/// is what the liveness sweep measures. Returns `false` if the claim no
/// longer holds the job.
pub fn set_stage(
    db: &Database,
    id: &str,
    claim_token: &str,
    stage: JobStage,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET stage = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'PROCESSING' AND claim_token = ?4",
            params![id, stage.as_str(), format_ts(now), claim_token],
        )?;
        Ok(changed == 1)
    })
}

/// Marks a running job `COMPLETED` if `claim_token` still holds it.
pub fn complete(
    db: &Database,
    id: &str,
    claim_token: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'COMPLETED', stage = 'completed', error = NULL,
             claim_token = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'PROCESSING' AND claim_token = ?3",
            params![id, format_ts(now), claim_token],
        )?;
        Ok(changed == 1)
    })
}

fn apply_failure(
    conn: &Connection,
    job: &Job,
    error: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(Job, FailureDecision), DatabaseError> {
    let decision = policy.decide(job.attempts, job.max_attempts);
    let ts = format_ts(now);

    match decision {
        FailureDecision::Retry { attempts, delay } => {
            conn.execute(
                "UPDATE jobs SET status = 'PENDING', stage = 'queued', attempts = ?2,
                 next_run_at = ?3, error = ?4, claim_token = NULL, updated_at = ?5
                 WHERE id = ?1",
                params![job.id, attempts, format_ts(after(now, delay)), error, ts],
            )?;
        }
        FailureDecision::Dead { attempts } => {
            conn.execute(
                "UPDATE jobs SET status = 'DEAD', stage = 'dead', attempts = ?2,
                 error = ?3, claim_token = NULL, updated_at = ?4
                 WHERE id = ?1",
                params![job.id, attempts, error, ts],
            )?;
        }
    }

    let updated = query_one(
        conn,
        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
        params![job.id],
    )?
    .ok_or(DatabaseError::Sqlite(rusqlite::Error::QueryReturnedNoRows))?;

    Ok((updated, decision))
}

/// Folds one failed attempt into a running job: increments `attempts` by
/// exactly one and either schedules a retry with backoff or dead-letters
/// it. Returns `None` if `claim_token` no longer holds the job (it was
/// settled or reclaimed elsewhere).
pub fn record_failure(
    db: &Database,
    id: &str,
    claim_token: &str,
    error: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Option<(Job, FailureDecision)>, DatabaseError> {
    db.with_tx(|tx| {
        let job = query_one(
            tx,
            &format!(
                "SELECT {} FROM jobs WHERE id = ?1 AND status = 'PROCESSING' AND claim_token = ?2",
                JOB_COLUMNS
            ),
            params![id, claim_token],
        )?;
        match job {
            Some(job) => apply_failure(tx, &job, error, policy, now).map(Some),
            None => Ok(None),
        }
    })
}

/// Hands a running job back to the queue without counting an attempt.
/// Used when the worker lost the store mid-job through no fault of the job.
/// Returns `false` if `claim_token` no longer holds it.
pub fn release(
    db: &Database,
    id: &str,
    claim_token: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = format_ts(now);
        let changed = conn.execute(
            "UPDATE jobs SET status = 'PENDING', stage = 'queued', claim_token = NULL,
             next_run_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'PROCESSING' AND claim_token = ?3",
            params![id, ts, claim_token],
        )?;
        Ok(changed == 1)
    })
}

/// Liveness sweep: every `PROCESSING` job not touched since `stale_before`
/// is treated as one failed attempt (its worker presumably died).
pub fn reclaim_stale(
    db: &Database,
    stale_before: DateTime<Utc>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<(Job, FailureDecision)>, DatabaseError> {
    db.with_tx(|tx| {
        let stale = query_many(
            tx,
            &format!(
                "SELECT {} FROM jobs WHERE status = 'PROCESSING' AND updated_at < ?1
                 ORDER BY updated_at ASC",
                JOB_COLUMNS
            ),
            params![format_ts(stale_before)],
        )?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for job in stale {
            let error = format!(
                "lease expired: no progress since {} (stage {})",
                format_ts(job.updated_at),
                job.stage
            );
            reclaimed.push(apply_failure(tx, &job, &error, policy, now)?);
        }
        Ok(reclaimed)
    })
}

/// Administrative reset of a `DEAD` job: back to `PENDING` with a clean
/// slate, eligible immediately. Returns `None` if the job is not `DEAD`.
pub fn reset_dead(db: &Database, id: &str, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| {
        query_one(
            conn,
            &format!(
                "UPDATE jobs SET status = 'PENDING', stage = 'queued', attempts = 0, error = NULL,
                 claim_token = NULL, next_run_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'DEAD'
                 RETURNING {}",
                JOB_COLUMNS
            ),
            params![id, format_ts(now)],
        )
    })
}

/// Jobs in `status`, most recently updated first.
pub fn list_by_status(db: &Database, status: JobStatus, limit: u32) -> Result<Vec<Job>, DatabaseError> {
    db.with_conn(|conn| {
        query_many(
            conn,
            &format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY updated_at DESC, rowid DESC LIMIT ?2",
                JOB_COLUMNS
            ),
            params![status.as_str(), limit],
        )
    })
}

/// Jobs attached to a document, oldest first.
pub fn list_for_document(db: &Database, document_id: &str) -> Result<Vec<Job>, DatabaseError> {
    db.with_conn(|conn| {
        query_many(
            conn,
            &format!(
                "SELECT {} FROM jobs WHERE document_id = ?1 ORDER BY created_at ASC, rowid ASC",
                JOB_COLUMNS
            ),
            params![document_id],
        )
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: JobStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
