pub mod embedding_queue;

pub use embedding_queue::{
    EmbeddingJob, EmbeddingQueue, JobError, JobOutcome, JobSource, QueueStatus,
};
