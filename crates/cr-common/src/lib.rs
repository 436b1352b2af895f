pub mod api;
pub mod config;
pub mod db;
pub mod embedding;
pub mod keywords;
pub mod logging;
pub mod queue;
pub mod ranking;
pub mod run_id;
pub mod scoring;
pub mod vector_store;

use chrono::{DateTime, Utc};

// Commonly used data models for the ranking engine and the embedding pipeline.

/// A candidate profile as stored in `rank.candidates`.
///
/// The embedding is nullable: freshly created or re-edited profiles stay
/// without a vector until the embedding pipeline processes them. The
/// embedding and its metadata are written only by the pipeline and only
/// as a full overwrite keyed by candidate id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateProfile {
    pub id: i64,
    pub tenant_id: String,
    pub title: String,
    pub skills: Vec<String>,
    pub body: String,
    pub active: bool,
    pub embedding: Option<Vec<f32>>,
    pub embedding_meta: Option<EmbeddingMeta>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CandidateProfile {
    /// Concatenated text the embedding pipeline snapshots into a job.
    pub fn profile_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&self.title);
        for skill in &self.skills {
            text.push(' ');
            text.push_str(skill);
        }
        if !self.body.is_empty() {
            text.push(' ');
            text.push_str(&self.body);
        }
        text
    }
}

/// Provenance recorded next to a stored embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMeta {
    pub model_id: String,
    pub generated_at: DateTime<Utc>,
    pub token_count: i32,
}
