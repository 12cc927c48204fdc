//! Job repository, the durable log behind the processing queue.
//!
//! Every function takes `now` explicitly so scheduling can be tested without
//! sleeping. Scheduling columns (`available_at`, `lease_expires_at`) are epoch
//! milliseconds; audit columns are RFC 3339 text.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use super::document_repo::{format_timestamp, parse_timestamp};
use super::{Database, DatabaseError};
use crate::queue::{
    AbandonedJob, FailureOutcome, JobHandle, JobPayload, ProcessingJob, QueueStats, SubmitOptions,
};

pub const STATUS_WAITING: &str = "waiting";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ABANDONED: &str = "abandoned";

const LEASE_EXPIRED: &str = "lease expired";

/// A raw queue row.
#[derive(Debug, Clone)]
pub struct QueueJobRow {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub idempotency_key: String,
    pub payload: String,
    pub options: String,
    pub status: String,
    pub attempts_made: u32,
    pub available_at: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_error: Option<String>,
    pub enqueued_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
    /// Set once the job's document has been moved to `failed`.
    pub escalated_at: Option<String>,
}

impl QueueJobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            name: row.get("name")?,
            idempotency_key: row.get("idempotency_key")?,
            payload: row.get("payload")?,
            options: row.get("options")?,
            status: row.get("status")?,
            attempts_made: row.get("attempts_made")?,
            available_at: row.get("available_at")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at: row.get("lease_expires_at")?,
            last_error: row.get("last_error")?,
            enqueued_at: row.get("enqueued_at")?,
            updated_at: row.get("updated_at")?,
            finished_at: row.get("finished_at")?,
            escalated_at: row.get("escalated_at")?,
        })
    }

    pub fn payload(&self) -> Result<JobPayload, DatabaseError> {
        serde_json::from_str(&self.payload).map_err(|e| DatabaseError::Corrupt {
            column: "payload",
            reason: e.to_string(),
        })
    }

    pub fn options(&self) -> Result<SubmitOptions, DatabaseError> {
        serde_json::from_str(&self.options).map_err(|e| DatabaseError::Corrupt {
            column: "options",
            reason: e.to_string(),
        })
    }

    fn to_processing_job(&self) -> Result<ProcessingJob, DatabaseError> {
        let payload = self.payload()?;
        let options = self.options()?;
        Ok(ProcessingJob {
            job_id: self.id.clone(),
            document_id: payload.document_id,
            source_location: payload.source_location,
            attempt_count: self.attempts_made,
            max_attempts: options.max_attempts,
            enqueued_at: parse_timestamp("enqueued_at", &self.enqueued_at)?,
        })
    }

    fn to_abandoned(&self) -> Result<AbandonedJob, DatabaseError> {
        let payload = self.payload()?;
        Ok(AbandonedJob {
            job_id: self.id.clone(),
            document_id: payload.document_id,
            source_location: payload.source_location,
            attempts_made: self.attempts_made,
            last_error: self.last_error.clone(),
        })
    }
}

/// Result of an operation that requires holding the job's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome<T> {
    Done(T),
    UnknownJob,
    LeaseLost,
}

fn millis_after(now: DateTime<Utc>, delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(delay_ms)
}

fn find_in(tx: &Transaction<'_>, id: &str) -> Result<Option<QueueJobRow>, DatabaseError> {
    Ok(tx
        .query_row(
            "SELECT * FROM queue_jobs WHERE id = ?1",
            params![id],
            QueueJobRow::from_row,
        )
        .optional()?)
}

/// Inserts a job unless one for the same idempotency key is still waiting,
/// running, or retained as completed; in that case the existing handle is
/// returned with `deduplicated` set.
pub fn submit(
    db: &Database,
    queue: &str,
    name: &str,
    payload: &JobPayload,
    options: &SubmitOptions,
    now: DateTime<Utc>,
) -> Result<JobHandle, DatabaseError> {
    let payload_json = serde_json::to_string(payload).map_err(|e| DatabaseError::Corrupt {
        column: "payload",
        reason: e.to_string(),
    })?;
    let options_json = serde_json::to_string(options).map_err(|e| DatabaseError::Corrupt {
        column: "options",
        reason: e.to_string(),
    })?;
    let timestamp = format_timestamp(&now);

    db.with_tx(|tx| {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM queue_jobs
                 WHERE queue = ?1 AND idempotency_key = ?2 AND status IN (?3, ?4, ?5)
                 ORDER BY seq DESC LIMIT 1",
                params![
                    queue,
                    payload.document_id,
                    STATUS_WAITING,
                    STATUS_ACTIVE,
                    STATUS_COMPLETED
                ],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(job_id) = existing {
            return Ok(JobHandle {
                job_id,
                queue: queue.to_string(),
                deduplicated: true,
            });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO queue_jobs (id, queue, name, idempotency_key, payload, options, status,
             attempts_made, available_at, enqueued_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)",
            params![
                job_id,
                queue,
                name,
                payload.document_id,
                payload_json,
                options_json,
                STATUS_WAITING,
                now.timestamp_millis(),
                timestamp,
            ],
        )?;

        Ok(JobHandle {
            job_id,
            queue: queue.to_string(),
            deduplicated: false,
        })
    })
}

/// Returns jobs whose lease ran out to the waiting set, counting the lost
/// delivery as a failed attempt. Jobs that have no attempts left are
/// abandoned and returned.
pub fn reclaim_expired(
    db: &Database,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<Vec<AbandonedJob>, DatabaseError> {
    let timestamp = format_timestamp(&now);

    db.with_tx(|tx| {
        let expired: Vec<QueueJobRow> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM queue_jobs
                 WHERE queue = ?1 AND status = ?2 AND lease_expires_at <= ?3
                 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(
                    params![queue, STATUS_ACTIVE, now.timestamp_millis()],
                    QueueJobRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut abandoned = Vec::new();
        for row in expired {
            let options = row.options()?;
            if row.attempts_made >= options.max_attempts {
                tx.execute(
                    "UPDATE queue_jobs SET status = ?2, lease_owner = NULL, lease_expires_at = NULL,
                     last_error = ?3, updated_at = ?4, finished_at = ?4
                     WHERE id = ?1",
                    params![row.id, STATUS_ABANDONED, LEASE_EXPIRED, timestamp],
                )?;
                let mut row = row;
                row.last_error = Some(LEASE_EXPIRED.to_string());
                abandoned.push(row.to_abandoned()?);
            } else {
                let available_at = millis_after(now, options.backoff.delay_for(row.attempts_made));
                tx.execute(
                    "UPDATE queue_jobs SET status = ?2, lease_owner = NULL, lease_expires_at = NULL,
                     last_error = ?3, available_at = ?4, updated_at = ?5
                     WHERE id = ?1",
                    params![row.id, STATUS_WAITING, LEASE_EXPIRED, available_at, timestamp],
                )?;
            }
        }

        Ok(abandoned)
    })
}

/// Claims the next ready job for `worker_id` and starts a new attempt.
pub fn reserve(
    db: &Database,
    queue: &str,
    worker_id: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<Option<(ProcessingJob, DateTime<Utc>)>, DatabaseError> {
    let timestamp = format_timestamp(&now);
    let lease_expires_at = millis_after(now, lease);

    db.with_tx(|tx| {
        let next = tx
            .query_row(
                "SELECT * FROM queue_jobs
                 WHERE queue = ?1 AND status = ?2 AND available_at <= ?3
                 ORDER BY available_at, seq LIMIT 1",
                params![queue, STATUS_WAITING, now.timestamp_millis()],
                QueueJobRow::from_row,
            )
            .optional()?;

        let Some(mut row) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue_jobs SET status = ?2, attempts_made = attempts_made + 1,
             lease_owner = ?3, lease_expires_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![row.id, STATUS_ACTIVE, worker_id, lease_expires_at, timestamp],
        )?;
        row.attempts_made += 1;

        let expires = DateTime::<Utc>::from_timestamp_millis(lease_expires_at).unwrap_or(now);
        Ok(Some((row.to_processing_job()?, expires)))
    })
}

fn check_lease(row: Option<&QueueJobRow>, worker_id: &str) -> Option<LeaseOutcome<()>> {
    match row {
        None => Some(LeaseOutcome::UnknownJob),
        Some(row)
            if row.status != STATUS_ACTIVE || row.lease_owner.as_deref() != Some(worker_id) =>
        {
            Some(LeaseOutcome::LeaseLost)
        }
        Some(_) => None,
    }
}

/// Acknowledges a successful delivery.
pub fn ack(
    db: &Database,
    job_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<LeaseOutcome<()>, DatabaseError> {
    let timestamp = format_timestamp(&now);

    db.with_tx(|tx| {
        let row = find_in(tx, job_id)?;
        if let Some(rejected) = check_lease(row.as_ref(), worker_id) {
            return Ok(rejected);
        }
        let Some(row) = row else {
            return Ok(LeaseOutcome::UnknownJob);
        };

        if row.options()?.remove_on_complete {
            tx.execute("DELETE FROM queue_jobs WHERE id = ?1", params![job_id])?;
        } else {
            tx.execute(
                "UPDATE queue_jobs SET status = ?2, lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = ?3, finished_at = ?3
                 WHERE id = ?1",
                params![job_id, STATUS_COMPLETED, timestamp],
            )?;
        }
        Ok(LeaseOutcome::Done(()))
    })
}

/// Reports a failed delivery. Schedules a retry after the backoff, or
/// abandons the job when its attempts are used up.
pub fn fail(
    db: &Database,
    job_id: &str,
    worker_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<LeaseOutcome<FailureOutcome>, DatabaseError> {
    let timestamp = format_timestamp(&now);

    db.with_tx(|tx| {
        let row = find_in(tx, job_id)?;
        if let Some(rejected) = check_lease(row.as_ref(), worker_id) {
            return Ok(match rejected {
                LeaseOutcome::UnknownJob => LeaseOutcome::UnknownJob,
                _ => LeaseOutcome::LeaseLost,
            });
        }
        let Some(row) = row else {
            return Ok(LeaseOutcome::UnknownJob);
        };

        let options = row.options()?;
        if row.attempts_made >= options.max_attempts {
            tx.execute(
                "UPDATE queue_jobs SET status = ?2, lease_owner = NULL, lease_expires_at = NULL,
                 last_error = ?3, updated_at = ?4, finished_at = ?4
                 WHERE id = ?1",
                params![job_id, STATUS_ABANDONED, error, timestamp],
            )?;
            return Ok(LeaseOutcome::Done(FailureOutcome::Abandoned));
        }

        let delay = options.backoff.delay_for(row.attempts_made);
        tx.execute(
            "UPDATE queue_jobs SET status = ?2, lease_owner = NULL, lease_expires_at = NULL,
             last_error = ?3, available_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                job_id,
                STATUS_WAITING,
                error,
                millis_after(now, delay),
                timestamp
            ],
        )?;

        Ok(LeaseOutcome::Done(FailureOutcome::Retrying {
            next_attempt: row.attempts_made + 1,
            delay,
        }))
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<QueueJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM queue_jobs WHERE id = ?1",
                params![id],
                QueueJobRow::from_row,
            )
            .optional()?)
    })
}

/// Lists abandoned jobs of a queue, oldest first.
pub fn list_abandoned(db: &Database, queue: &str) -> Result<Vec<AbandonedJob>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM queue_jobs WHERE queue = ?1 AND status = ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![queue, STATUS_ABANDONED], QueueJobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter().map(QueueJobRow::to_abandoned).collect()
    })
}

/// Abandoned jobs whose document has not been escalated yet, oldest first.
///
/// Abandoning a job and failing its document are separate writes; this is
/// how a consumer picks up escalations lost between the two.
pub fn list_unescalated(db: &Database, queue: &str) -> Result<Vec<AbandonedJob>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM queue_jobs
             WHERE queue = ?1 AND status = ?2 AND escalated_at IS NULL
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![queue, STATUS_ABANDONED], QueueJobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter().map(QueueJobRow::to_abandoned).collect()
    })
}

/// Records that an abandoned job's document was escalated. Returns false if
/// the job is gone or not abandoned.
pub fn mark_escalated(db: &Database, job_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let changed = tx.execute(
            "UPDATE queue_jobs SET escalated_at = ?3
             WHERE id = ?1 AND status = ?2 AND escalated_at IS NULL",
            params![job_id, STATUS_ABANDONED, format_timestamp(&now)],
        )?;
        Ok(changed == 1)
    })
}

/// Counts jobs per status.
pub fn stats(db: &Database, queue: &str) -> Result<QueueStats, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM queue_jobs WHERE queue = ?1 GROUP BY status")?;
        let counts = stmt
            .query_map(params![queue], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            let count = u64::try_from(count).unwrap_or_default();
            match status.as_str() {
                STATUS_WAITING => stats.waiting = count,
                STATUS_ACTIVE => stats.active = count,
                STATUS_COMPLETED => stats.completed = count,
                STATUS_ABANDONED => stats.abandoned = count,
                other => log::warn!("Ignoring unknown queue status '{}'", other),
            }
        }
        Ok(stats)
    })
}
