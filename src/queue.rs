use crate::error::ServiceError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Maximum deliveries before a job is parked as failed.
pub const MAX_DELIVERY_ATTEMPTS: i64 = 5;
/// Base delay for the exponential retry backoff.
pub const INITIAL_RETRY_DELAY_SECS: i64 = 60;
/// How long a claimed job may run before it is considered abandoned and
/// handed to another consumer.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

/// Wire payload of a transcription job. The field names are the queue's
/// fixed message schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionJob {
    pub id: String,
    pub filename: String,
    pub start_transcription: bool,
}

impl TranscriptionJob {
    pub fn new(id: &str, filename: &str) -> Self {
        Self {
            id: id.to_string(),
            filename: filename.to_string(),
            start_transcription: true,
        }
    }
}

/// A job handed to a consumer. Holding a claim does not remove the row;
/// only [`ack`] does, logically, by marking it done.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: i64,
    pub payload: TranscriptionJob,
    pub attempt: i64,
}

/// Outcome of a negative acknowledgement.
#[derive(Debug, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled; next delivery not before the contained timestamp.
    Retry { next_attempt_at: i64 },
    /// Attempts exhausted; the job is parked as failed.
    Failed,
}

/// Publish a job. The row is durable: it survives process restarts and is
/// only retired by an acknowledgement after successful processing.
#[instrument(skip(conn), err)]
pub fn enqueue(
    conn: &Connection,
    job: &TranscriptionJob,
) -> Result<i64, ServiceError> {
    let payload = serde_json::to_string(job)
        .map_err(|e| ServiceError::Queue(e.to_string()))?;
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO transcription_jobs (
            video_id, payload, status, attempt_count,
            next_attempt_at, created_at, updated_at
        ) VALUES (?, ?, 'pending', 0, NULL, ?, ?)",
        params![job.id, payload, now, now],
    )
    .map_err(|e| ServiceError::Queue(e.to_string()))?;
    let job_id = conn.last_insert_rowid();
    debug!("enqueued transcription job {} for video {}", job_id, job.id);
    Ok(job_id)
}

/// Claim the oldest ready job, if any. The claim moves the row to
/// `running`, bumps the attempt count and sets a lease expiry; a consumer
/// that dies without acking loses the lease and the job is redelivered.
pub fn claim_next(
    conn: &Connection,
    lease: Duration,
) -> Result<Option<ClaimedJob>, ServiceError> {
    let now = chrono::Utc::now().timestamp();
    let candidate: Option<i64> = conn
        .query_row(
            "SELECT job_id FROM transcription_jobs
             WHERE status = 'pending'
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
             ORDER BY created_at ASC, job_id ASC
             LIMIT 1",
            params![now],
            |row| row.get(0),
        )
        .optional()?;

    let Some(job_id) = candidate else {
        return Ok(None);
    };

    // Guarded update: a concurrent consumer may have taken the row between
    // the select and here.
    let claimed = conn.execute(
        "UPDATE transcription_jobs
         SET status = 'running',
             attempt_count = attempt_count + 1,
             lease_expires_at = ?,
             updated_at = ?
         WHERE job_id = ? AND status = 'pending'",
        params![now + lease.as_secs() as i64, now, job_id],
    )?;
    if claimed == 0 {
        return Ok(None);
    }

    let (payload, attempt): (String, i64) = conn.query_row(
        "SELECT payload, attempt_count FROM transcription_jobs
         WHERE job_id = ?",
        params![job_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let payload: TranscriptionJob = serde_json::from_str(&payload)
        .map_err(|e| ServiceError::Queue(e.to_string()))?;

    Ok(Some(ClaimedJob {
        job_id,
        payload,
        attempt,
    }))
}

/// Acknowledge successful processing. Only called once the transcription
/// has been written back.
pub fn ack(conn: &Connection, job_id: i64) -> Result<(), ServiceError> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "UPDATE transcription_jobs
         SET status = 'done', lease_expires_at = NULL, updated_at = ?
         WHERE job_id = ?",
        params![now, job_id],
    )?;
    Ok(())
}

/// Negative acknowledgement: reschedule with exponential backoff, or park
/// the job as failed once the attempts are used up.
#[instrument(skip(conn), err)]
pub fn nack(
    conn: &Connection,
    job_id: i64,
    error: &str,
) -> Result<NackOutcome, ServiceError> {
    let now = chrono::Utc::now().timestamp();
    let attempts: i64 = conn.query_row(
        "SELECT attempt_count FROM transcription_jobs WHERE job_id = ?",
        params![job_id],
        |row| row.get(0),
    )?;

    if attempts >= MAX_DELIVERY_ATTEMPTS {
        conn.execute(
            "UPDATE transcription_jobs
             SET status = 'failed', lease_expires_at = NULL,
                 last_error = ?, updated_at = ?
             WHERE job_id = ?",
            params![error, now, job_id],
        )?;
        warn!(
            "job {} failed permanently after {} attempts: {}",
            job_id, attempts, error
        );
        return Ok(NackOutcome::Failed);
    }

    let delay = INITIAL_RETRY_DELAY_SECS * (1 << (attempts - 1).max(0));
    let next_attempt_at = now + delay;
    conn.execute(
        "UPDATE transcription_jobs
         SET status = 'pending', lease_expires_at = NULL,
             next_attempt_at = ?, last_error = ?, updated_at = ?
         WHERE job_id = ?",
        params![next_attempt_at, error, now, job_id],
    )?;
    Ok(NackOutcome::Retry { next_attempt_at })
}

/// Terminal failure regardless of remaining attempts. Used when retrying
/// can never succeed, e.g. the record the job points at does not exist.
pub fn fail(
    conn: &Connection,
    job_id: i64,
    error: &str,
) -> Result<(), ServiceError> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "UPDATE transcription_jobs
         SET status = 'failed', lease_expires_at = NULL,
             last_error = ?, updated_at = ?
         WHERE job_id = ?",
        params![error, now, job_id],
    )?;
    Ok(())
}

/// Return running jobs with expired leases to the pending state. This is
/// the redelivery path that makes delivery at-least-once when a consumer
/// crashes mid-job.
pub fn release_expired(conn: &Connection) -> Result<usize, ServiceError> {
    let now = chrono::Utc::now().timestamp();
    let released = conn.execute(
        "UPDATE transcription_jobs
         SET status = 'pending', lease_expires_at = NULL, updated_at = ?
         WHERE status = 'running' AND lease_expires_at <= ?",
        params![now, now],
    )?;
    if released > 0 {
        warn!("released {} expired job leases for redelivery", released);
    }
    Ok(released)
}

/// Count of jobs waiting or due for delivery. Exposed for the status
/// endpoint.
pub fn pending_count(conn: &Connection) -> Result<i64, ServiceError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM transcription_jobs WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_videos_db;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        init_videos_db(&mut conn).expect("schema");
        conn
    }

    fn job_status(conn: &Connection, job_id: i64) -> String {
        conn.query_row(
            "SELECT status FROM transcription_jobs WHERE job_id = ?",
            params![job_id],
            |row| row.get(0),
        )
        .expect("status")
    }

    #[test]
    fn enqueue_claim_ack_lifecycle() -> Result<(), ServiceError> {
        let conn = test_conn();
        let job = TranscriptionJob::new("vid-1", "vid-1.webm");
        let job_id = enqueue(&conn, &job)?;

        let claimed = claim_next(&conn, DEFAULT_LEASE)?.expect("claimed");
        assert_eq!(claimed.job_id, job_id);
        assert_eq!(claimed.payload, job);
        assert!(claimed.payload.start_transcription);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(job_status(&conn, job_id), "running");

        // A running job is invisible to other consumers.
        assert!(claim_next(&conn, DEFAULT_LEASE)?.is_none());

        ack(&conn, job_id)?;
        assert_eq!(job_status(&conn, job_id), "done");
        assert!(claim_next(&conn, DEFAULT_LEASE)?.is_none());
        Ok(())
    }

    #[test]
    fn claims_are_delivered_in_publish_order() -> Result<(), ServiceError> {
        let conn = test_conn();
        enqueue(&conn, &TranscriptionJob::new("first", "first.webm"))?;
        enqueue(&conn, &TranscriptionJob::new("second", "second.webm"))?;

        let a = claim_next(&conn, DEFAULT_LEASE)?.expect("first claim");
        let b = claim_next(&conn, DEFAULT_LEASE)?.expect("second claim");
        assert_eq!(a.payload.id, "first");
        assert_eq!(b.payload.id, "second");
        Ok(())
    }

    #[test]
    fn expired_lease_is_redelivered() -> Result<(), ServiceError> {
        let conn = test_conn();
        let job_id =
            enqueue(&conn, &TranscriptionJob::new("vid-1", "vid-1.webm"))?;

        // Claim with an already-expired lease to simulate a crashed
        // consumer.
        let claimed =
            claim_next(&conn, Duration::from_secs(0))?.expect("claimed");
        assert_eq!(claimed.attempt, 1);

        assert_eq!(release_expired(&conn)?, 1);
        let redelivered =
            claim_next(&conn, DEFAULT_LEASE)?.expect("redelivered");
        assert_eq!(redelivered.job_id, job_id);
        assert_eq!(redelivered.attempt, 2);
        Ok(())
    }

    #[test]
    fn nack_backs_off_then_fails_permanently() -> Result<(), ServiceError> {
        let conn = test_conn();
        let job_id =
            enqueue(&conn, &TranscriptionJob::new("vid-1", "vid-1.webm"))?;

        let mut delays = Vec::new();
        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            // Make the backoff schedule immediately due so the next claim
            // succeeds without sleeping.
            conn.execute(
                "UPDATE transcription_jobs SET next_attempt_at = NULL
                 WHERE job_id = ?",
                params![job_id],
            )?;
            let claimed =
                claim_next(&conn, DEFAULT_LEASE)?.expect("claimed");
            assert_eq!(claimed.attempt, attempt);

            let outcome = nack(&conn, job_id, "provider unavailable")?;
            if attempt < MAX_DELIVERY_ATTEMPTS {
                let NackOutcome::Retry { next_attempt_at } = outcome else {
                    panic!("expected retry on attempt {}", attempt);
                };
                delays.push(
                    next_attempt_at - chrono::Utc::now().timestamp(),
                );
            } else {
                assert_eq!(outcome, NackOutcome::Failed);
            }
        }

        // Exponential: each scheduled delay doubles the previous one.
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0] * 2 - 2, "delays: {:?}", delays);
        }
        assert_eq!(job_status(&conn, job_id), "failed");
        assert!(claim_next(&conn, DEFAULT_LEASE)?.is_none());
        Ok(())
    }

    #[test]
    fn fail_is_terminal() -> Result<(), ServiceError> {
        let conn = test_conn();
        let job_id =
            enqueue(&conn, &TranscriptionJob::new("vid-1", "vid-1.webm"))?;
        claim_next(&conn, DEFAULT_LEASE)?.expect("claimed");

        fail(&conn, job_id, "record vanished")?;
        assert_eq!(job_status(&conn, job_id), "failed");
        assert!(claim_next(&conn, DEFAULT_LEASE)?.is_none());
        Ok(())
    }

    #[test]
    fn payload_uses_the_fixed_wire_schema() {
        let job = TranscriptionJob::new("abc", "abc.webm");
        let json = serde_json::to_value(&job).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "id": "abc",
                "filename": "abc.webm",
                "startTranscription": true
            })
        );
    }
}
