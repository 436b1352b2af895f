pub mod candidates;
pub mod embedding_queue;
pub mod migrations;
pub mod pool;
pub mod tenant_config;

// Keep re-exports unique so downstream crates see a single symbol per helper.
pub use candidates::{
    CandidateStorageError, PgCandidateSource, fetch_embedding_rows, fetch_profiles_by_ids,
    overwrite_embedding, search_profiles_by_keywords,
};
pub use embedding_queue::{
    QueueStorageError, complete_job, enqueue_embedding_job, fetch_dashboard, get_job_by_id,
    list_jobs, lock_next_pending_job, move_to_dead_letter, recover_stuck_jobs,
    requeue_for_retry, retry_dead_letter_job,
};
pub use migrations::{MigrationError, run_migrations};
pub use pool::{DbPoolError, PgPool, create_pool_from_url, create_pool_from_url_checked};
pub use tenant_config::{ConfigStorageError, PgConfigSource, fetch_scoring_config};
