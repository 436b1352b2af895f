use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{EmbeddingJob, JobSource, QueueStatus};

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    25
}

/// Query-string pagination for queue listings. 1-based pages.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl Pagination {
    pub const MAX_PAGE_SIZE: usize = 200;

    /// Clamp out-of-range values instead of erroring; the dashboard is
    /// an operator surface.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }

    pub fn offset(&self) -> i64 {
        let offset = self.page.saturating_sub(1).saturating_mul(self.page_size);
        i64::try_from(offset).unwrap_or(i64::MAX)
    }
}

/// Optional filters for the job listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueJobFilter {
    pub status: Option<QueueStatus>,
    pub source: Option<JobSource>,
    pub candidate_id: Option<i64>,
}

/// Wire shape of one queue record. Mirrors the storage row but keeps
/// the snapshot text out of list payloads.
#[derive(Debug, Clone, Serialize)]
pub struct QueueJobView {
    pub id: u64,
    pub candidate_id: i64,
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

impl From<&EmbeddingJob> for QueueJobView {
    fn from(job: &EmbeddingJob) -> Self {
        Self {
            id: job.id,
            candidate_id: job.candidate_id,
            source: job.source,
            status: job.status.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            queued_at: job.queued_at,
            next_retry_at: job.next_retry_at,
            locked_by: job.locked_by.clone(),
            processing_started_at: job.processing_started_at,
            completed_at: job.completed_at,
            last_error: job.last_error.clone(),
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueJobListResponse {
    pub jobs: Vec<QueueJobView>,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

/// Per-status counts plus the age of the oldest waiting job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDashboard {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub oldest_pending_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryJobResponse {
    pub original_job_id: u64,
    pub new_job_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_normalization() {
        let p = Pagination::default();
        assert_eq!(p.page, 1);
        assert_eq!(p.page_size, 25);

        let clamped = Pagination {
            page: 0,
            page_size: 10_000,
        }
        .normalized();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.page_size, Pagination::MAX_PAGE_SIZE);
    }

    #[test]
    fn pagination_offset_is_zero_based() {
        let p = Pagination {
            page: 3,
            page_size: 25,
        };
        assert_eq!(p.offset(), 50);
        assert_eq!(p.limit(), 25);
    }

    #[test]
    fn pagination_offset_saturates_for_huge_pages() {
        let p = Pagination {
            page: usize::MAX,
            page_size: 25,
        }
        .normalized();
        assert_eq!(p.offset(), i64::MAX);
        assert_eq!(p.limit(), 25);
    }

    #[test]
    fn filter_deserializes_snake_case_status() {
        let filter: QueueJobFilter =
            serde_json::from_str(r#"{"status":"dead_letter","source":"profile_updated"}"#)
                .unwrap();
        assert_eq!(filter.status, Some(QueueStatus::DeadLetter));
        assert_eq!(filter.source, Some(JobSource::ProfileUpdated));
    }
}
