use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Row;
use tokio_postgres::Error as PgError;
use tokio_postgres::types::ToSql;
use tracing::{info, instrument, warn};

use crate::api::queue_job::{Pagination, QueueDashboard, QueueJobFilter, QueueJobListResponse,
    QueueJobView};
use crate::queue::{EmbeddingJob, JobSource, QueueStatus};

use super::pool::PgPool;

#[derive(Debug, Error)]
pub enum QueueStorageError {
    #[error("failed to get connection from pool: {0}")]
    Pool(#[from] PoolError),
    #[error("database error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map queue row: {0}")]
    Mapping(String),
    #[error("queue job {0} not found")]
    NotFound(u64),
    #[error("invalid queue transition: {0}")]
    Conflict(String),
}

const JOB_COLUMNS: &str = "id, candidate_id, profile_text, source, status, retry_count, \
     max_retries, queued_at, next_retry_at, locked_by, processing_started_at, completed_at, \
     last_error, updated_at";

fn parse_status(value: &str) -> Result<QueueStatus, QueueStorageError> {
    match value {
        "pending" => Ok(QueueStatus::Pending),
        "processing" => Ok(QueueStatus::Processing),
        "completed" => Ok(QueueStatus::Completed),
        "failed" => Ok(QueueStatus::Failed),
        "dead_letter" => Ok(QueueStatus::DeadLetter),
        other => Err(QueueStorageError::Mapping(format!(
            "unknown queue status '{other}'"
        ))),
    }
}

fn parse_source(value: &str) -> Result<JobSource, QueueStorageError> {
    match value {
        "profile_created" => Ok(JobSource::ProfileCreated),
        "profile_updated" => Ok(JobSource::ProfileUpdated),
        "backfill" => Ok(JobSource::Backfill),
        "manual" => Ok(JobSource::Manual),
        other => Err(QueueStorageError::Mapping(format!(
            "unknown job source '{other}'"
        ))),
    }
}

fn job_id_from_db(id: i64) -> Result<u64, QueueStorageError> {
    u64::try_from(id).map_err(|_| QueueStorageError::Mapping(format!("negative job id {id}")))
}

fn job_id_to_db(id: u64) -> Result<i64, QueueStorageError> {
    i64::try_from(id).map_err(|_| QueueStorageError::Mapping(format!("job id {id} out of range")))
}

fn retry_count_from_db(value: i32, column: &str) -> Result<u32, QueueStorageError> {
    u32::try_from(value)
        .map_err(|_| QueueStorageError::Mapping(format!("negative {column} {value}")))
}

fn row_to_job(row: &Row) -> Result<EmbeddingJob, QueueStorageError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| QueueStorageError::Mapping(format!("id: {e}")))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| QueueStorageError::Mapping(format!("status: {e}")))?;
    let source: String = row
        .try_get("source")
        .map_err(|e| QueueStorageError::Mapping(format!("source: {e}")))?;
    let retry_count: i32 = row
        .try_get("retry_count")
        .map_err(|e| QueueStorageError::Mapping(format!("retry_count: {e}")))?;
    let max_retries: i32 = row
        .try_get("max_retries")
        .map_err(|e| QueueStorageError::Mapping(format!("max_retries: {e}")))?;

    Ok(EmbeddingJob {
        id: job_id_from_db(id)?,
        candidate_id: row
            .try_get("candidate_id")
            .map_err(|e| QueueStorageError::Mapping(format!("candidate_id: {e}")))?,
        profile_text: row
            .try_get("profile_text")
            .map_err(|e| QueueStorageError::Mapping(format!("profile_text: {e}")))?,
        source: parse_source(&source)?,
        status: parse_status(&status)?,
        retry_count: retry_count_from_db(retry_count, "retry_count")?,
        max_retries: retry_count_from_db(max_retries, "max_retries")?,
        queued_at: row
            .try_get("queued_at")
            .map_err(|e| QueueStorageError::Mapping(format!("queued_at: {e}")))?,
        next_retry_at: row
            .try_get("next_retry_at")
            .map_err(|e| QueueStorageError::Mapping(format!("next_retry_at: {e}")))?,
        locked_by: row
            .try_get("locked_by")
            .map_err(|e| QueueStorageError::Mapping(format!("locked_by: {e}")))?,
        processing_started_at: row
            .try_get("processing_started_at")
            .map_err(|e| QueueStorageError::Mapping(format!("processing_started_at: {e}")))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| QueueStorageError::Mapping(format!("completed_at: {e}")))?,
        last_error: row
            .try_get("last_error")
            .map_err(|e| QueueStorageError::Mapping(format!("last_error: {e}")))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| QueueStorageError::Mapping(format!("updated_at: {e}")))?,
    })
}

/// Enqueue one embedding job carrying a snapshot of the profile text.
#[instrument(skip(pool, profile_text))]
pub async fn enqueue_embedding_job(
    pool: &PgPool,
    candidate_id: i64,
    profile_text: &str,
    source: JobSource,
) -> Result<u64, QueueStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "INSERT INTO rank.embedding_queue (candidate_id, profile_text, source)
             VALUES ($1, $2, $3)
             RETURNING id",
            &[&candidate_id, &profile_text.to_string(), &source.as_str()],
        )
        .await?;

    let id = job_id_from_db(row.get(0))?;
    info!(job_id = id, candidate_id, source = source.as_str(), "enqueued embedding job");
    Ok(id)
}

/// Claim the oldest eligible pending job for this worker.
///
/// `FOR UPDATE SKIP LOCKED` lets concurrent workers claim disjoint jobs
/// without serializing on the queue head. Jobs deferred by
/// `next_retry_at` stay invisible until their backoff elapses.
#[instrument(skip(pool))]
pub async fn lock_next_pending_job(
    pool: &PgPool,
    worker_id: &str,
) -> Result<Option<EmbeddingJob>, QueueStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!(
                "UPDATE rank.embedding_queue
                 SET status = 'processing',
                     locked_by = $1,
                     processing_started_at = NOW(),
                     updated_at = NOW()
                 WHERE id = (
                     SELECT id FROM rank.embedding_queue
                     WHERE status = 'pending'
                       AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                     ORDER BY queued_at, id
                     LIMIT 1
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING {JOB_COLUMNS}"
            ),
            &[&worker_id.to_string()],
        )
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Mark a processing job as completed and release the lock.
#[instrument(skip(pool))]
pub async fn complete_job(pool: &PgPool, job_id: u64) -> Result<(), QueueStorageError> {
    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE rank.embedding_queue
             SET status = 'completed',
                 completed_at = NOW(),
                 locked_by = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
            &[&job_id_to_db(job_id)?],
        )
        .await?;

    if updated == 0 {
        return Err(QueueStorageError::Conflict(format!(
            "job {job_id} is not processing"
        )));
    }
    Ok(())
}

/// Record a retryable failure. The processed record becomes terminal
/// `failed` and a fresh pending successor is inserted with the same
/// snapshot, an incremented retry counter and a deferred visibility
/// time. Both writes happen in one transaction.
#[instrument(skip(pool, job, error))]
pub async fn requeue_for_retry(
    pool: &PgPool,
    job: &EmbeddingJob,
    error: &str,
    retry_at: DateTime<Utc>,
) -> Result<u64, QueueStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let updated = tx
        .execute(
            "UPDATE rank.embedding_queue
             SET status = 'failed',
                 last_error = $2,
                 completed_at = NOW(),
                 locked_by = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
            &[&job_id_to_db(job.id)?, &error.to_string()],
        )
        .await?;
    if updated == 0 {
        return Err(QueueStorageError::Conflict(format!(
            "job {} is not processing",
            job.id
        )));
    }

    let successor = job.retry_successor(retry_at);
    let row = tx
        .query_one(
            "INSERT INTO rank.embedding_queue
                 (candidate_id, profile_text, source, retry_count, max_retries, next_retry_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
            &[
                &successor.candidate_id,
                &successor.profile_text,
                &successor.source.as_str(),
                &i32::try_from(successor.retry_count)
                    .map_err(|_| QueueStorageError::Mapping("retry_count overflow".into()))?,
                &i32::try_from(successor.max_retries)
                    .map_err(|_| QueueStorageError::Mapping("max_retries overflow".into()))?,
                &successor.next_retry_at,
            ],
        )
        .await?;
    tx.commit().await?;

    let new_id = job_id_from_db(row.get(0))?;
    info!(
        job_id = job.id,
        successor_id = new_id,
        retry_count = successor.retry_count,
        "requeued embedding job for retry"
    );
    Ok(new_id)
}

/// Move a processing job to the terminal dead-letter state.
#[instrument(skip(pool, error))]
pub async fn move_to_dead_letter(
    pool: &PgPool,
    job_id: u64,
    error: &str,
) -> Result<(), QueueStorageError> {
    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE rank.embedding_queue
             SET status = 'dead_letter',
                 last_error = $2,
                 completed_at = NOW(),
                 locked_by = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
            &[&job_id_to_db(job_id)?, &error.to_string()],
        )
        .await?;

    if updated == 0 {
        return Err(QueueStorageError::Conflict(format!(
            "job {job_id} is not processing"
        )));
    }
    warn!(job_id, "embedding job moved to dead letter");
    Ok(())
}

/// Return jobs stuck in `processing` longer than `stuck_after` to
/// `pending` so another worker can claim them. Used by the recovery
/// binary after worker crashes.
#[instrument(skip(pool))]
pub async fn recover_stuck_jobs(
    pool: &PgPool,
    stuck_after: Duration,
) -> Result<u64, QueueStorageError> {
    let client = pool.get().await?;
    let cutoff = Utc::now() - stuck_after;
    let recovered = client
        .execute(
            "UPDATE rank.embedding_queue
             SET status = 'pending',
                 locked_by = NULL,
                 processing_started_at = NULL,
                 last_error = 'recovered: worker lock expired',
                 updated_at = NOW()
             WHERE status = 'processing' AND processing_started_at < $1",
            &[&cutoff],
        )
        .await?;

    if recovered > 0 {
        warn!(recovered, "recovered stuck embedding jobs");
    }
    Ok(recovered)
}

/// Paged job listing for the dashboard, newest first. Fetches one row
/// past the page to report `has_more` without a count query.
#[instrument(skip(pool, filter))]
pub async fn list_jobs(
    pool: &PgPool,
    filter: &QueueJobFilter,
    pagination: Pagination,
) -> Result<QueueJobListResponse, QueueStorageError> {
    let client = pool.get().await?;
    let pagination = pagination.normalized();

    let mut sql = format!("SELECT {JOB_COLUMNS} FROM rank.embedding_queue WHERE TRUE");
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

    if let Some(status) = &filter.status {
        params.push(Box::new(status.as_str()));
        sql.push_str(&format!(" AND status = ${}", params.len()));
    }
    if let Some(source) = &filter.source {
        params.push(Box::new(source.as_str()));
        sql.push_str(&format!(" AND source = ${}", params.len()));
    }
    if let Some(candidate_id) = filter.candidate_id {
        params.push(Box::new(candidate_id));
        sql.push_str(&format!(" AND candidate_id = ${}", params.len()));
    }

    params.push(Box::new(pagination.limit() + 1));
    let limit_idx = params.len();
    params.push(Box::new(pagination.offset()));
    let offset_idx = params.len();
    sql.push_str(&format!(
        " ORDER BY queued_at DESC, id DESC LIMIT ${limit_idx} OFFSET ${offset_idx}"
    ));

    let param_refs: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
    let rows = client.query(&sql, &param_refs).await?;

    let mut jobs = rows
        .iter()
        .map(row_to_job)
        .collect::<Result<Vec<_>, _>>()?;
    let has_more = jobs.len() > pagination.page_size;
    jobs.truncate(pagination.page_size);

    Ok(QueueJobListResponse {
        jobs: jobs.iter().map(QueueJobView::from).collect(),
        page: pagination.page,
        page_size: pagination.page_size,
        has_more,
    })
}

#[instrument(skip(pool))]
pub async fn get_job_by_id(
    pool: &PgPool,
    job_id: u64,
) -> Result<Option<EmbeddingJob>, QueueStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!("SELECT {JOB_COLUMNS} FROM rank.embedding_queue WHERE id = $1"),
            &[&job_id_to_db(job_id)?],
        )
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Manually re-enqueue a dead-letter job. The dead-letter record stays
/// in place for auditing; the new record starts a fresh retry budget
/// under the `manual` source.
#[instrument(skip(pool))]
pub async fn retry_dead_letter_job(pool: &PgPool, job_id: u64) -> Result<u64, QueueStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            &format!(
                "SELECT {JOB_COLUMNS} FROM rank.embedding_queue WHERE id = $1 FOR UPDATE"
            ),
            &[&job_id_to_db(job_id)?],
        )
        .await?;
    let Some(row) = row else {
        return Err(QueueStorageError::NotFound(job_id));
    };
    let job = row_to_job(&row)?;
    if job.status != QueueStatus::DeadLetter {
        return Err(QueueStorageError::Conflict(format!(
            "job {job_id} is {}, only dead_letter jobs can be retried",
            job.status.as_str()
        )));
    }

    let inserted = tx
        .query_one(
            "INSERT INTO rank.embedding_queue (candidate_id, profile_text, source)
             VALUES ($1, $2, 'manual')
             RETURNING id",
            &[&job.candidate_id, &job.profile_text],
        )
        .await?;
    tx.commit().await?;

    let new_id = job_id_from_db(inserted.get(0))?;
    info!(job_id, new_job_id = new_id, "dead-letter job manually re-enqueued");
    Ok(new_id)
}

/// Per-status counts plus the age of the oldest waiting job.
#[instrument(skip(pool))]
pub async fn fetch_dashboard(pool: &PgPool) -> Result<QueueDashboard, QueueStorageError> {
    let client = pool.get().await?;

    let rows = client
        .query(
            "SELECT status, COUNT(*)::BIGINT AS count
             FROM rank.embedding_queue
             GROUP BY status",
            &[],
        )
        .await?;

    let mut dashboard = QueueDashboard::default();
    for row in &rows {
        let status: String = row
            .try_get("status")
            .map_err(|e| QueueStorageError::Mapping(format!("status: {e}")))?;
        let count: i64 = row
            .try_get("count")
            .map_err(|e| QueueStorageError::Mapping(format!("count: {e}")))?;
        match parse_status(&status)? {
            QueueStatus::Pending => dashboard.pending = count,
            QueueStatus::Processing => dashboard.processing = count,
            QueueStatus::Completed => dashboard.completed = count,
            QueueStatus::Failed => dashboard.failed = count,
            QueueStatus::DeadLetter => dashboard.dead_letter = count,
        }
    }

    let oldest = client
        .query_one(
            "SELECT EXTRACT(EPOCH FROM (NOW() - MIN(queued_at)))::BIGINT
             FROM rank.embedding_queue
             WHERE status = 'pending'",
            &[],
        )
        .await?;
    dashboard.oldest_pending_age_seconds = oldest
        .try_get::<_, Option<i64>>(0)
        .map_err(|e| QueueStorageError::Mapping(format!("oldest pending age: {e}")))?;

    Ok(dashboard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::DeadLetter,
        ] {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
        assert!(parse_status("stalled").is_err());
    }

    #[test]
    fn source_round_trips_through_storage_names() {
        for source in [
            JobSource::ProfileCreated,
            JobSource::ProfileUpdated,
            JobSource::Backfill,
            JobSource::Manual,
        ] {
            assert_eq!(parse_source(source.as_str()).unwrap(), source);
        }
        assert!(parse_source("webhook").is_err());
    }

    #[test]
    fn job_ids_reject_out_of_range_values() {
        assert!(job_id_from_db(-1).is_err());
        assert_eq!(job_id_from_db(42).unwrap(), 42);
        assert!(job_id_to_db(u64::MAX).is_err());
    }
}
