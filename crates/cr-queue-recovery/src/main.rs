use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use cr_common::db::{create_pool_from_url, recover_stuck_jobs};
use cr_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};
use cr_common::queue::{EmbeddingQueue, QueueStatus};

#[derive(Debug, Parser)]
#[command(
    name = "cr-queue-recovery",
    about = "Return embedding jobs stuck in processing to the pending queue"
)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Jobs processing longer than this are considered abandoned
    #[arg(long, env = "CR_STUCK_AFTER_MINUTES", default_value_t = 15)]
    stuck_after_minutes: i64,
}

/// Same transition as the storage-side recovery, for the in-memory
/// queue model.
pub fn recover(queue: &mut EmbeddingQueue, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
    let mut recovered = 0;
    for job in queue.jobs.iter_mut() {
        let abandoned = job.status == QueueStatus::Processing
            && job.processing_started_at.map(|ts| ts < cutoff).unwrap_or(true);
        if abandoned {
            job.status = QueueStatus::Pending;
            job.locked_by = None;
            job.processing_started_at = None;
            job.next_retry_at = Some(now);
            job.updated_at = now;
            recovered += 1;
        }
    }
    recovered
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing_subscriber("cr-queue-recovery");
    install_tracing_panic_hook("cr-queue-recovery");

    let args = Cli::parse();
    if args.stuck_after_minutes <= 0 {
        return Err("--stuck-after-minutes must be positive".into());
    }

    let pool = create_pool_from_url(&args.db_url)?;
    let recovered =
        recover_stuck_jobs(&pool, Duration::minutes(args.stuck_after_minutes)).await?;

    info!(
        recovered,
        stuck_after_minutes = args.stuck_after_minutes,
        "queue recovery finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("cr-queue-recovery failed: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cr_common::queue::{EmbeddingJob, JobSource};

    fn stuck_job(started_minutes_ago: i64) -> EmbeddingJob {
        let mut job = EmbeddingJob::new(7, "senior rust engineer", JobSource::ProfileCreated);
        job.status = QueueStatus::Processing;
        job.locked_by = Some("worker_stub".into());
        job.processing_started_at = Some(Utc::now() - Duration::minutes(started_minutes_ago));
        job
    }

    #[test]
    fn abandoned_processing_jobs_return_to_pending() {
        let mut queue = EmbeddingQueue::default();
        queue.enqueue(stuck_job(30));

        let now = Utc::now();
        let cutoff = now - Duration::minutes(15);
        let recovered = recover(&mut queue, cutoff, now);

        assert_eq!(recovered, 1);
        let job = queue.jobs.first().unwrap();
        assert_eq!(job.status, QueueStatus::Pending);
        assert_eq!(job.locked_by, None);
        assert!(job.processing_started_at.is_none());
        assert_eq!(job.next_retry_at, Some(now));
    }

    #[test]
    fn recent_processing_jobs_are_left_locked() {
        let mut queue = EmbeddingQueue::default();
        queue.enqueue(stuck_job(5));

        let now = Utc::now();
        let cutoff = now - Duration::minutes(15);
        let recovered = recover(&mut queue, cutoff, now);

        assert_eq!(recovered, 0);
        let job = queue.jobs.first().unwrap();
        assert_eq!(job.status, QueueStatus::Processing);
        assert!(job.locked_by.is_some());
    }

    #[test]
    fn non_processing_jobs_are_untouched() {
        let mut queue = EmbeddingQueue::default();
        let mut pending = EmbeddingJob::new(8, "pending text", JobSource::Backfill);
        pending.updated_at = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        queue.enqueue(pending);

        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        let recovered = recover(&mut queue, now - Duration::minutes(15), now);

        assert_eq!(recovered, 0);
        let job = queue.jobs.first().unwrap();
        assert_eq!(job.status, QueueStatus::Pending);
        assert_eq!(job.next_retry_at, None);
        assert!(job.updated_at < now);
    }
}
