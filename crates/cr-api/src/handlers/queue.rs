use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use cr_common::api::queue_job::{
    Pagination, QueueDashboard, QueueJobFilter, QueueJobListResponse, QueueJobView,
    RetryJobResponse,
};
use cr_common::db::{
    enqueue_embedding_job, fetch_dashboard, fetch_profiles_by_ids, get_job_by_id,
    list_jobs as fetch_listed_jobs, retry_dead_letter_job,
};
use cr_common::queue::JobSource;

use crate::SharedState;
use crate::error::ApiError;

/// Flat query parameters for the job listing. Kept as one struct so
/// axum's query extractor can parse the numeric fields directly.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<cr_common::queue::QueueStatus>,
    pub source: Option<JobSource>,
    pub candidate_id: Option<i64>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl ListJobsParams {
    fn split(self) -> (QueueJobFilter, Pagination) {
        let defaults = Pagination::default();
        (
            QueueJobFilter {
                status: self.status,
                source: self.source,
                candidate_id: self.candidate_id,
            },
            Pagination {
                page: self.page.unwrap_or(defaults.page),
                page_size: self.page_size.unwrap_or(defaults.page_size),
            },
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueJobBody {
    pub candidate_id: i64,
    #[serde(default = "default_enqueue_source")]
    pub source: JobSource,
}

fn default_enqueue_source() -> JobSource {
    JobSource::Manual
}

#[derive(Debug, serde::Serialize)]
pub struct EnqueueJobResponse {
    pub job_id: u64,
}

pub async fn dashboard(
    State(state): State<SharedState>,
) -> Result<Json<QueueDashboard>, ApiError> {
    let dashboard = fetch_dashboard(&state.pool).await?;
    Ok(Json(dashboard))
}

pub async fn list_jobs(
    State(state): State<SharedState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<QueueJobListResponse>, ApiError> {
    if let Some(page_size) = params.page_size {
        if page_size == 0 || page_size > Pagination::MAX_PAGE_SIZE {
            return Err(ApiError::BadRequest(format!(
                "page_size must be between 1 and {}",
                Pagination::MAX_PAGE_SIZE
            )));
        }
    }
    if params.page == Some(0) {
        return Err(ApiError::BadRequest("page is 1-based".into()));
    }

    let (filter, pagination) = params.split();
    let jobs = fetch_listed_jobs(&state.pool, &filter, pagination).await?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Json<QueueJobView>, ApiError> {
    let job = get_job_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;

    Ok(Json(QueueJobView::from(&job)))
}

/// Manually enqueue an embedding job for a candidate, snapshotting the
/// current profile text.
pub async fn enqueue_job(
    State(state): State<SharedState>,
    Json(body): Json<EnqueueJobBody>,
) -> Result<Json<EnqueueJobResponse>, ApiError> {
    let profiles = fetch_profiles_by_ids(&state.pool, &[body.candidate_id]).await?;
    let profile = profiles
        .first()
        .ok_or_else(|| ApiError::NotFound(format!("candidate {} not found", body.candidate_id)))?;

    let job_id =
        enqueue_embedding_job(&state.pool, profile.id, &profile.profile_text(), body.source)
            .await?;
    Ok(Json(EnqueueJobResponse { job_id }))
}

pub async fn retry_job(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Json<RetryJobResponse>, ApiError> {
    let new_job_id = retry_dead_letter_job(&state.pool, id).await?;
    Ok(Json(RetryJobResponse {
        original_job_id: id,
        new_job_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_common::queue::QueueStatus;

    #[test]
    fn split_applies_pagination_defaults() {
        let params = ListJobsParams {
            status: Some(QueueStatus::DeadLetter),
            ..Default::default()
        };
        let (filter, pagination) = params.split();
        assert_eq!(filter.status, Some(QueueStatus::DeadLetter));
        assert_eq!(pagination.page, 1);
        assert_eq!(pagination.page_size, 25);
    }

    #[test]
    fn enqueue_body_defaults_to_manual_source() {
        let body: EnqueueJobBody = serde_json::from_str(r#"{"candidate_id":7}"#).unwrap();
        assert_eq!(body.source, JobSource::Manual);
    }
}
