use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use rand::Rng;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

use cr_common::EmbeddingMeta;
use cr_common::db::{
    PgPool, complete_job, create_pool_from_url, lock_next_pending_job, move_to_dead_letter,
    overwrite_embedding, requeue_for_retry,
};
use cr_common::embedding::{self, EmbeddingGenerator};
use cr_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};
use cr_common::queue::{EmbeddingJob, EmbeddingQueue, JobError, JobOutcome, JobSource};

#[derive(Debug, Clone)]
struct WorkerRuntimeConfig {
    backoff_base_secs: u64,
    backoff_max_secs: u64,
    jitter_percent: u8,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            jitter_percent: 20,
        }
    }
}

impl WorkerRuntimeConfig {
    fn from_env() -> Self {
        fn parse_u64(key: &str, default: u64) -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(default)
        }

        fn parse_jitter() -> u8 {
            std::env::var("CR_RETRY_JITTER_PERCENT")
                .ok()
                .and_then(|raw| raw.parse::<u8>().ok())
                .unwrap_or(20)
                .min(100)
        }

        Self {
            backoff_base_secs: parse_u64("CR_RETRY_BACKOFF_BASE_SECONDS", 30),
            backoff_max_secs: parse_u64("CR_RETRY_BACKOFF_MAX_SECONDS", 3600),
            jitter_percent: parse_jitter(),
        }
    }

    /// Exponential backoff for the next attempt, capped and jittered so
    /// a burst of failures does not retry in lockstep.
    fn backoff_delay(&self, retry_count: u32) -> chrono::Duration {
        let shift = retry_count.min(16);
        let exp = self
            .backoff_base_secs
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_secs);

        let secs = if self.jitter_percent == 0 {
            exp as f64
        } else {
            let spread = f64::from(self.jitter_percent) / 100.0;
            let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
            (exp as f64 * factor).max(1.0)
        };

        chrono::Duration::seconds(secs.round() as i64)
    }
}

#[derive(Debug, Parser)]
#[command(name = "cr-embed-worker", about = "Process queued candidate embedding jobs")]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Worker id recorded into the queue lock
    #[arg(long, default_value = "cr-embed-worker")]
    worker_id: String,

    /// Number of concurrent polling loops
    #[arg(long, env = "CR_WORKER_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Optional cap on how many jobs to process in one run (default: until queue is empty)
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Exit when the queue is empty instead of polling forever
    #[arg(long, default_value_t = false)]
    exit_on_empty: bool,

    /// Idle poll interval in milliseconds when running as a long-lived service
    #[arg(long, default_value_t = 5000)]
    idle_poll_interval_ms: u64,
}

fn token_count(text: &str) -> i32 {
    i32::try_from(text.split_whitespace().count()).unwrap_or(i32::MAX)
}

/// Embed one job's snapshot text. Blank snapshots and input rejections
/// are permanent; backend timeouts and rate limits are retryable.
fn handle_embedding_job(
    job: &EmbeddingJob,
    generator: &dyn EmbeddingGenerator,
) -> Result<(Vec<f32>, JobOutcome), JobError> {
    if job.profile_text.trim().is_empty() {
        return Err(JobError::Permanent {
            message: "empty profile text snapshot".into(),
        });
    }

    let vector = generator.embed_one(&job.profile_text).map_err(|err| {
        let message = err.to_string();
        if err.is_retryable() {
            JobError::Retryable {
                message,
                retry_after: None,
            }
        } else {
            JobError::Permanent { message }
        }
    })?;

    Ok((
        vector,
        JobOutcome {
            model_id: generator.model_id().to_string(),
            token_count: token_count(&job.profile_text),
        },
    ))
}

/// Persist the outcome of one claimed job. The embedding write and the
/// queue transition are separate statements; if the process dies
/// between them the job is recovered and re-embedded, which is
/// idempotent because the overwrite is keyed by candidate id.
async fn apply_job_outcome(
    pool: &PgPool,
    config: &WorkerRuntimeConfig,
    job: &EmbeddingJob,
    outcome: Result<(Vec<f32>, JobOutcome), JobError>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match outcome {
        Ok((vector, outcome)) => {
            let meta = EmbeddingMeta {
                model_id: outcome.model_id,
                generated_at: Utc::now(),
                token_count: outcome.token_count,
            };
            let stored = overwrite_embedding(pool, job.candidate_id, &vector, &meta).await?;
            complete_job(pool, job.id).await?;
            info!(
                job_id = job.id,
                candidate_id = job.candidate_id,
                stored,
                "embedding job completed"
            );
        }
        Err(JobError::Permanent { message }) => {
            move_to_dead_letter(pool, job.id, &message).await?;
            error!(
                job_id = job.id,
                candidate_id = job.candidate_id,
                dead_letter = true,
                error = %message,
                "embedding job dead-lettered"
            );
        }
        Err(JobError::Retryable {
            message,
            retry_after,
        }) => {
            if job.retries_exhausted() {
                move_to_dead_letter(pool, job.id, &message).await?;
                error!(
                    job_id = job.id,
                    candidate_id = job.candidate_id,
                    retry_count = job.retry_count,
                    dead_letter = true,
                    error = %message,
                    "retries exhausted; embedding job dead-lettered"
                );
            } else {
                let delay = retry_after
                    .unwrap_or_else(|| config.backoff_delay(job.retry_count));
                let retry_at = Utc::now() + delay;
                let successor = requeue_for_retry(pool, job, &message, retry_at).await?;
                warn!(
                    job_id = job.id,
                    successor_id = successor,
                    candidate_id = job.candidate_id,
                    retry_at = %retry_at,
                    error = %message,
                    "embedding job failed; retry enqueued"
                );
            }
        }
    }

    Ok(())
}

/// In-memory rendition of the worker against the sample queue; keeps
/// the state machine exercised without a database.
pub fn run_sample_flow_with_worker(worker_id: &str) -> EmbeddingQueue {
    let generator = embedding::create_generator(&embedding::load_config_from_env());
    let mut queue = EmbeddingQueue::default();

    queue.enqueue(EmbeddingJob::new(
        1,
        "Senior Rust Engineer rust kubernetes postgres",
        JobSource::Backfill,
    ));
    queue.process_next_with_worker(worker_id, |job| {
        handle_embedding_job(job, generator.as_ref()).map(|(_, outcome)| outcome)
    });

    queue
}

struct LoopOutcome {
    processed: usize,
}

async fn worker_loop(
    pool: PgPool,
    worker_id: String,
    config: WorkerRuntimeConfig,
    generator: Arc<dyn EmbeddingGenerator>,
    budget: Arc<AtomicUsize>,
    exit_on_empty: bool,
    idle_poll_interval: Duration,
) -> Result<LoopOutcome, Box<dyn std::error::Error + Send + Sync>> {
    let mut processed = 0usize;

    loop {
        if budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
            left.checked_sub(1)
        }).is_err()
        {
            break;
        }

        let maybe_job = lock_next_pending_job(&pool, &worker_id).await?;

        let Some(job) = maybe_job else {
            // Hand the unused budget slot back before idling.
            budget.fetch_add(1, Ordering::SeqCst);
            if exit_on_empty {
                break;
            }
            sleep(idle_poll_interval).await;
            continue;
        };

        let outcome = handle_embedding_job(&job, generator.as_ref());
        apply_job_outcome(&pool, &config, &job, outcome).await?;
        processed += 1;
    }

    Ok(LoopOutcome { processed })
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    init_tracing_subscriber("cr-embed-worker");
    install_tracing_panic_hook("cr-embed-worker");

    let args = Cli::parse();
    let config = WorkerRuntimeConfig::from_env();
    let generator: Arc<dyn EmbeddingGenerator> =
        Arc::from(embedding::create_generator(&embedding::load_config_from_env()));
    let pool = create_pool_from_url(&args.db_url)?;

    let status = pool.status();
    info!(
        size = status.size,
        available = status.available,
        worker_id = %args.worker_id,
        concurrency = args.concurrency,
        model = generator.model_id(),
        dimension = generator.dimension(),
        backoff_base_secs = config.backoff_base_secs,
        backoff_max_secs = config.backoff_max_secs,
        "created postgres connection pool for embed worker",
    );

    let budget = Arc::new(AtomicUsize::new(args.max_jobs.unwrap_or(usize::MAX)));
    let idle_poll_interval = Duration::from_millis(args.idle_poll_interval_ms);

    let mut handles = Vec::new();
    for n in 0..args.concurrency.max(1) {
        let handle = tokio::spawn(worker_loop(
            pool.clone(),
            format!("{}-{n}", args.worker_id),
            config.clone(),
            Arc::clone(&generator),
            Arc::clone(&budget),
            args.exit_on_empty,
            idle_poll_interval,
        ));
        handles.push(handle);
    }

    let mut total = 0usize;
    for handle in handles {
        let outcome = handle.await??;
        total += outcome.processed;
    }

    info!(processed = total, "embed worker run finished");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("cr-embed-worker failed: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_common::embedding::EmbedError;
    use cr_common::queue::QueueStatus;

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        use std::sync::Mutex;
        static ENV_GUARD: Mutex<()> = Mutex::new(());
        let _guard = ENV_GUARD.lock().unwrap();

        let prev: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(v) => unsafe { std::env::set_var(key, v) },
                    None => unsafe { std::env::remove_var(key) },
                }
                (key.to_string(), previous)
            })
            .collect();

        f();

        for (key, previous) in prev {
            if let Some(v) = previous {
                unsafe { std::env::set_var(&key, v) };
            } else {
                unsafe { std::env::remove_var(&key) };
            }
        }
    }

    #[test]
    fn sample_flow_completes_the_job() {
        let queue = run_sample_flow_with_worker("embed-worker-test");

        assert_eq!(queue.jobs.len(), 1);
        let job = &queue.jobs[0];
        assert_eq!(job.status, QueueStatus::Completed);
        assert!(job.locked_by.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn blank_snapshot_is_dead_lettered_without_retry() {
        let generator = embedding::create_generator(&embedding::EmbeddingConfig::default());
        let mut queue = EmbeddingQueue::default();
        queue.enqueue(EmbeddingJob::new(2, "   ", JobSource::ProfileUpdated));

        let status = queue.process_next_with_worker("embed-worker-test", |job| {
            handle_embedding_job(job, generator.as_ref()).map(|(_, outcome)| outcome)
        });

        assert_eq!(status, Some(QueueStatus::DeadLetter));
        let job = &queue.jobs[0];
        assert_eq!(job.retry_count, 0);
        assert!(job.last_error.as_deref().unwrap().contains("empty profile text"));
    }

    #[test]
    fn successful_outcome_reports_model_and_tokens() {
        let generator = embedding::create_generator(&embedding::EmbeddingConfig::default());
        let job = EmbeddingJob::new(3, "rust engineer kubernetes", JobSource::ProfileCreated);

        let (vector, outcome) = handle_embedding_job(&job, generator.as_ref()).unwrap();

        assert_eq!(vector.len(), generator.dimension());
        assert_eq!(outcome.model_id, "hash-v1");
        assert_eq!(outcome.token_count, 3);
    }

    #[test]
    fn retryable_errors_map_to_retryable_job_failures() {
        struct FlakyGenerator;
        impl EmbeddingGenerator for FlakyGenerator {
            fn model_id(&self) -> &str {
                "flaky"
            }
            fn dimension(&self) -> usize {
                4
            }
            fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
                Err(EmbedError::RateLimited("try later".into()))
            }
        }

        let job = EmbeddingJob::new(4, "some text", JobSource::Manual);
        let err = handle_embedding_job(&job, &FlakyGenerator).unwrap_err();
        assert!(matches!(err, JobError::Retryable { .. }));
    }

    #[test]
    fn backoff_doubles_per_retry_and_respects_the_cap() {
        let config = WorkerRuntimeConfig {
            backoff_base_secs: 30,
            backoff_max_secs: 120,
            jitter_percent: 0,
        };

        assert_eq!(config.backoff_delay(0).num_seconds(), 30);
        assert_eq!(config.backoff_delay(1).num_seconds(), 60);
        assert_eq!(config.backoff_delay(2).num_seconds(), 120);
        assert_eq!(config.backoff_delay(10).num_seconds(), 120);
    }

    #[tokio::test]
    async fn loop_errors_propagate_through_spawned_handles() {
        // Same drain shape as run(): join the spawned loop, then
        // surface its inner result with `?`.
        async fn drain(
            handle: tokio::task::JoinHandle<
                Result<LoopOutcome, Box<dyn std::error::Error + Send + Sync>>,
            >,
        ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
            let outcome = handle.await??;
            Ok(outcome.processed)
        }

        let ok = tokio::spawn(async { Ok(LoopOutcome { processed: 3 }) });
        assert_eq!(drain(ok).await.unwrap(), 3);

        let failing = tokio::spawn(async {
            Err::<LoopOutcome, _>("queue backend unavailable".into())
        });
        let err = drain(failing).await.unwrap_err();
        assert!(err.to_string().contains("queue backend unavailable"));
    }

    #[test]
    fn runtime_config_reads_env_overrides() {
        with_env(
            &[
                ("CR_RETRY_BACKOFF_BASE_SECONDS", Some("10")),
                ("CR_RETRY_BACKOFF_MAX_SECONDS", Some("300")),
                ("CR_RETRY_JITTER_PERCENT", Some("150")),
            ],
            || {
                let config = WorkerRuntimeConfig::from_env();
                assert_eq!(config.backoff_base_secs, 10);
                assert_eq!(config.backoff_max_secs, 300);
                assert_eq!(config.jitter_percent, 100, "jitter is capped at 100%");
            },
        );
    }
}
