pub mod queue_job;
pub mod rank_request;
pub mod rank_response;

pub use queue_job::{
    Pagination, QueueDashboard, QueueJobFilter, QueueJobListResponse, QueueJobView,
    RetryJobResponse,
};
pub use rank_request::RankRequestBody;
pub use rank_response::{RankItemView, RankResponseBody};
