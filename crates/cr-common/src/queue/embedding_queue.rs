use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Queue states. `Failed` marks a superseded attempt whose retry was
/// re-enqueued as a fresh record; `DeadLetter` is terminal and requires
/// manual inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }
}

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    ProfileCreated,
    ProfileUpdated,
    Backfill,
    Manual,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::ProfileCreated => "profile_created",
            JobSource::ProfileUpdated => "profile_updated",
            JobSource::Backfill => "backfill",
            JobSource::Manual => "manual",
        }
    }
}

/// One embedding attempt. Immutable once the attempt finishes: retries
/// never rewind this record, they enqueue a successor via
/// [`EmbeddingJob::retry_successor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: u64,
    pub candidate_id: i64,
    /// Snapshot of the profile text at enqueue time; the worker embeds
    /// this, not whatever the profile says later.
    pub profile_text: String,
    pub source: JobSource,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub queued_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingJob {
    pub fn new(candidate_id: i64, profile_text: &str, source: JobSource) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            candidate_id,
            profile_text: profile_text.to_string(),
            source,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            queued_at: now,
            next_retry_at: None,
            locked_by: None,
            processing_started_at: None,
            completed_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Build the replacement record for a retryable failure: same
    /// snapshot and source, incremented counter, fresh identity.
    pub fn retry_successor(&self, retry_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            candidate_id: self.candidate_id,
            profile_text: self.profile_text.clone(),
            source: self.source,
            status: QueueStatus::Pending,
            retry_count: self.retry_count + 1,
            max_retries: self.max_retries,
            queued_at: now,
            next_retry_at: Some(retry_at),
            locked_by: None,
            processing_started_at: None,
            completed_at: None,
            last_error: None,
            updated_at: now,
        }
    }
}

#[derive(Debug)]
pub enum JobError {
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    Permanent {
        message: String,
    },
}

#[derive(Debug)]
pub struct JobOutcome {
    pub model_id: String,
    pub token_count: i32,
}

/// In-memory queue with the same state machine as the Postgres-backed
/// storage; used by unit tests and the worker's sample flow.
#[derive(Default)]
pub struct EmbeddingQueue {
    pub jobs: Vec<EmbeddingJob>,
    next_id: u64,
}

impl EmbeddingQueue {
    pub fn enqueue(&mut self, mut job: EmbeddingJob) {
        self.next_id += 1;
        job.id = self.next_id;
        self.jobs.push(job);
    }

    fn poll_next(&self, now: DateTime<Utc>) -> Option<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| {
                job.status == QueueStatus::Pending
                    && job.next_retry_at.map(|ts| ts <= now).unwrap_or(true)
            })
            .min_by_key(|(_, job)| job.id)
            .map(|(idx, _)| idx)
    }

    pub fn process_next<F>(&mut self, handler: F) -> Option<QueueStatus>
    where
        F: Fn(&EmbeddingJob) -> Result<JobOutcome, JobError>,
    {
        self.process_next_with_worker("worker_stub", handler)
    }

    /// Pull one eligible job, run the handler, apply the outcome.
    /// Returns the terminal status of the processed record.
    pub fn process_next_with_worker<F>(
        &mut self,
        worker_id: &str,
        handler: F,
    ) -> Option<QueueStatus>
    where
        F: Fn(&EmbeddingJob) -> Result<JobOutcome, JobError>,
    {
        let now = Utc::now();
        let idx = self.poll_next(now)?;
        let mut job = self.jobs[idx].clone();
        job.status = QueueStatus::Processing;
        job.locked_by = Some(worker_id.to_string());
        job.processing_started_at = Some(now);
        job.updated_at = now;

        // Publish the pending → processing transition before running the
        // handler so observers see the lock.
        self.jobs[idx] = job.clone();

        match handler(&job) {
            Ok(_outcome) => {
                let finished_at = Utc::now();
                job.status = QueueStatus::Completed;
                job.completed_at = Some(finished_at);
                job.updated_at = finished_at;
                job.locked_by = None;
            }
            Err(JobError::Permanent { message }) => {
                let finished_at = Utc::now();
                job.status = QueueStatus::DeadLetter;
                job.last_error = Some(message);
                job.completed_at = Some(finished_at);
                job.updated_at = finished_at;
                job.locked_by = None;
            }
            Err(JobError::Retryable {
                message,
                retry_after,
            }) => {
                let finished_at = Utc::now();
                job.last_error = Some(message);
                job.completed_at = Some(finished_at);
                job.updated_at = finished_at;
                job.locked_by = None;

                if job.retries_exhausted() {
                    job.status = QueueStatus::DeadLetter;
                } else {
                    job.status = QueueStatus::Failed;
                    let retry_at =
                        finished_at + retry_after.unwrap_or_else(|| Duration::minutes(5));
                    let successor = job.retry_successor(retry_at);
                    self.jobs[idx] = job.clone();
                    self.enqueue(successor);
                    return Some(QueueStatus::Failed);
                }
            }
        }

        self.jobs[idx] = job;
        Some(self.jobs[idx].status.clone())
    }
}
