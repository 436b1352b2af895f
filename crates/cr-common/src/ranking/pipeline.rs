use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task;
use tracing::{info, warn};

use crate::CandidateProfile;
use crate::config::{ConfigCache, ConfigSource, ScoringConfig};
use crate::embedding::{EmbedError, EmbeddingGenerator};
use crate::keywords::{self, SearchQuery};
use crate::run_id;
use crate::scoring::{StrategyInput, apply_strategy};
use crate::vector_store::{SearchFilter, VectorStore};

const DEFAULT_RANK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum RankingError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} exceeded the request deadline")]
    Timeout(&'static str),
    #[error("transient ranking failure: {0}")]
    Transient(String),
    #[error("candidate storage failure: {0}")]
    Storage(String),
    #[error("internal ranking failure: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum CandidateSourceError {
    #[error("candidate lookup failed: {0}")]
    Lookup(String),
}

impl From<CandidateSourceError> for RankingError {
    fn from(value: CandidateSourceError) -> Self {
        RankingError::Storage(value.to_string())
    }
}

/// Read side of candidate storage as seen by the orchestrator: bulk
/// fetch for the pooled ids and the substring filter that backs the
/// last-resort fallback.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch_by_ids(&self, ids: &[i64])
    -> Result<Vec<CandidateProfile>, CandidateSourceError>;

    /// Case-insensitive substring match over stored text; reaches
    /// candidates that have no embedding yet.
    async fn search_text(
        &self,
        tenant_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<CandidateProfile>, CandidateSourceError>;
}

#[derive(Debug, Clone)]
pub struct RankRequest {
    pub query: String,
    pub tenant_id: String,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
    /// Per-request deadline; defaults to 10s.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub candidate_id: i64,
    pub final_score: f64,
    pub semantic_score: f64,
    pub matched_keywords: Vec<String>,
    pub keyword_scores: HashMap<String, f64>,
    pub explanation: String,
}

/// One page of ranked candidates. `degraded` marks the explicit empty
/// result produced when no fallback could surface a scorable
/// candidate; `fallback` names the path that produced the page.
#[derive(Debug, Clone, Serialize)]
pub struct RankPage {
    pub run_id: String,
    pub items: Vec<RankedResult>,
    pub page: usize,
    pub page_size: usize,
    pub pooled: usize,
    pub degraded: bool,
    pub fallback: Option<&'static str>,
}

/// Stateless ranking coordinator. Safe for concurrent use; the tenant
/// config cache is the only shared mutable state and it is read-mostly.
pub struct RankingEngine {
    generator: Arc<dyn EmbeddingGenerator>,
    vectors: Arc<dyn VectorStore>,
    candidates: Arc<dyn CandidateSource>,
    config_source: Arc<dyn ConfigSource>,
    config_cache: ConfigCache,
}

struct ScoredPool {
    results: Vec<RankedResult>,
    fallback: Option<&'static str>,
}

impl RankingEngine {
    pub fn new(
        generator: Arc<dyn EmbeddingGenerator>,
        vectors: Arc<dyn VectorStore>,
        candidates: Arc<dyn CandidateSource>,
        config_source: Arc<dyn ConfigSource>,
        config_ttl: Duration,
    ) -> Self {
        Self {
            generator,
            vectors,
            candidates,
            config_source,
            config_cache: ConfigCache::new(config_ttl),
        }
    }

    /// Rank candidates for a query. Attempts full hybrid ranking, then
    /// semantic-only with a relaxed threshold, then a plain keyword
    /// filter; each transition is logged under its own category. Zero
    /// scorable candidates yield a degraded empty page, not an error.
    pub async fn rank(&self, request: &RankRequest) -> Result<RankPage, RankingError> {
        validate(request)?;

        let deadline = Instant::now()
            + request
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RANK_TIMEOUT);

        let config = self
            .config_cache
            .get_or_load(&request.tenant_id, self.config_source.as_ref())
            .await;
        let query = SearchQuery::parse(&request.query, &request.tenant_id);
        let run_id = run_id::generate();

        info!(
            run_id = %run_id,
            tenant_id = %query.tenant_id,
            keywords = query.keywords.len(),
            strategy = config.strategy.as_str(),
            "rank request"
        );

        let pool = self.rank_with_fallbacks(&query, &config, deadline).await?;

        let mut results = pool.results;
        results.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(Ordering::Equal)
                .then(a.candidate_id.cmp(&b.candidate_id))
        });

        let pooled = results.len();
        let items = paginate(results, request.page, request.page_size);

        Ok(RankPage {
            run_id,
            degraded: pooled == 0,
            items,
            page: request.page,
            page_size: request.page_size,
            pooled,
            fallback: pool.fallback,
        })
    }

    async fn rank_with_fallbacks(
        &self,
        query: &SearchQuery,
        config: &ScoringConfig,
        deadline: Instant,
    ) -> Result<ScoredPool, RankingError> {
        match self.hybrid_pool(query, config, deadline).await {
            Ok(results) if !results.is_empty() => {
                return Ok(ScoredPool {
                    results,
                    fallback: None,
                });
            }
            Ok(_) => {
                warn!(
                    tenant_id = %query.tenant_id,
                    fallback = "semantic_only",
                    "hybrid ranking produced no candidates; relaxing to semantic-only"
                );
            }
            Err(err) => {
                warn!(
                    tenant_id = %query.tenant_id,
                    fallback = "semantic_only",
                    error = %err,
                    "hybrid ranking failed; relaxing to semantic-only"
                );
            }
        }

        match self.semantic_pool(query, config, deadline).await {
            Ok(results) if !results.is_empty() => {
                return Ok(ScoredPool {
                    results,
                    fallback: Some("semantic_only"),
                });
            }
            Ok(_) => {
                warn!(
                    tenant_id = %query.tenant_id,
                    fallback = "keyword_filter",
                    "semantic-only ranking produced no candidates; falling back to keyword filter"
                );
            }
            Err(err) => {
                warn!(
                    tenant_id = %query.tenant_id,
                    fallback = "keyword_filter",
                    error = %err,
                    "semantic-only ranking failed; falling back to keyword filter"
                );
            }
        }

        let results = self.keyword_pool(query, config, deadline).await?;
        Ok(ScoredPool {
            results,
            fallback: Some("keyword_filter"),
        })
    }

    /// Primary path: embed the query, pull a bounded pool by cosine
    /// k-NN, score keywords per candidate, apply the tenant strategy.
    async fn hybrid_pool(
        &self,
        query: &SearchQuery,
        config: &ScoringConfig,
        deadline: Instant,
    ) -> Result<Vec<RankedResult>, RankingError> {
        let hits = self.pooled_hits(query, config, deadline).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = hits.iter().map(|hit| hit.candidate_id).collect();
        let budget = remaining(deadline, "candidate fetch")?;
        let profiles = tokio::time::timeout(budget, self.candidates.fetch_by_ids(&ids))
            .await
            .map_err(|_| RankingError::Timeout("candidate fetch"))??;
        let by_id: HashMap<i64, &CandidateProfile> =
            profiles.iter().map(|p| (p.id, p)).collect();

        let mut results = Vec::with_capacity(hits.len());
        for hit in &hits {
            // A vector can outlive its profile row briefly; such hits are
            // partial data and drop out of this path silently.
            let Some(profile) = by_id.get(&hit.candidate_id) else {
                continue;
            };

            let keyword_scores = keywords::score_keywords(&query.keywords, profile);
            let semantic_score = f64::from(hit.similarity).clamp(0.0, 1.0);
            let outcome = apply_strategy(
                config.strategy,
                &StrategyInput {
                    keyword_scores: &keyword_scores,
                    semantic_score,
                    total_keywords: query.keywords.len(),
                },
            );

            results.push(RankedResult {
                candidate_id: hit.candidate_id,
                final_score: outcome.final_score,
                semantic_score,
                matched_keywords: outcome.matched_keywords,
                keyword_scores,
                explanation: outcome.explanation,
            });
        }

        Ok(results)
    }

    /// First fallback: similarity alone, admitted above the tenant's
    /// relaxed threshold.
    async fn semantic_pool(
        &self,
        query: &SearchQuery,
        config: &ScoringConfig,
        deadline: Instant,
    ) -> Result<Vec<RankedResult>, RankingError> {
        let threshold = f64::from(config.relaxed_semantic_threshold);
        let results = self
            .pooled_hits(query, config, deadline)
            .await?
            .into_iter()
            .filter_map(|hit| {
                let semantic_score = f64::from(hit.similarity).clamp(0.0, 1.0);
                if semantic_score < threshold {
                    return None;
                }
                Some(RankedResult {
                    candidate_id: hit.candidate_id,
                    final_score: semantic_score,
                    semantic_score,
                    matched_keywords: Vec::new(),
                    keyword_scores: HashMap::new(),
                    explanation: format!(
                        "Semantic match: similarity {:.0}% (keyword scoring unavailable)",
                        semantic_score * 100.0
                    ),
                })
            })
            .collect();

        Ok(results)
    }

    /// Last resort: substring filter over stored text, scored on
    /// keyword evidence alone. Reaches candidates without embeddings.
    async fn keyword_pool(
        &self,
        query: &SearchQuery,
        config: &ScoringConfig,
        deadline: Instant,
    ) -> Result<Vec<RankedResult>, RankingError> {
        let budget = remaining(deadline, "keyword filter")?;

        if query.keywords.is_empty() {
            return Ok(Vec::new());
        }

        let profiles = tokio::time::timeout(
            budget,
            self.candidates
                .search_text(&query.tenant_id, &query.keywords, config.pool_size),
        )
        .await
        .map_err(|_| RankingError::Timeout("keyword filter"))??;

        let results = profiles
            .iter()
            .map(|profile| {
                let keyword_scores = keywords::score_keywords(&query.keywords, profile);
                let outcome = apply_strategy(
                    config.strategy,
                    &StrategyInput {
                        keyword_scores: &keyword_scores,
                        semantic_score: 0.0,
                        total_keywords: query.keywords.len(),
                    },
                );
                RankedResult {
                    candidate_id: profile.id,
                    final_score: outcome.final_score,
                    semantic_score: 0.0,
                    matched_keywords: outcome.matched_keywords,
                    keyword_scores,
                    explanation: outcome.explanation,
                }
            })
            .collect();

        Ok(results)
    }

    /// Embed the query and run the k-NN scan, both off the async
    /// runtime and both bounded by the request deadline.
    async fn pooled_hits(
        &self,
        query: &SearchQuery,
        config: &ScoringConfig,
        deadline: Instant,
    ) -> Result<Vec<crate::vector_store::VectorHit>, RankingError> {
        let generator = Arc::clone(&self.generator);
        let raw = query.raw.clone();
        let query_vector = run_bounded(deadline, "query embedding", move || {
            generator.embed_one(&raw)
        })
        .await?
        .map_err(map_embed_error)?;

        let vectors = Arc::clone(&self.vectors);
        let filter = SearchFilter {
            tenant_id: Some(query.tenant_id.clone()),
            active_only: true,
        };
        let pool_size = config.pool_size.max(1);
        let hits = run_bounded(deadline, "vector search", move || {
            vectors.search(&query_vector, pool_size, &filter)
        })
        .await?;

        Ok(hits)
    }
}

fn validate(request: &RankRequest) -> Result<(), RankingError> {
    if request.query.trim().is_empty() {
        return Err(RankingError::Validation("query must not be empty".into()));
    }
    if request.tenant_id.trim().is_empty() {
        return Err(RankingError::Validation("tenant id must not be empty".into()));
    }
    if request.page == 0 {
        return Err(RankingError::Validation("page is 1-based".into()));
    }
    if request.page_size == 0 || request.page_size > MAX_PAGE_SIZE {
        return Err(RankingError::Validation(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

fn paginate(results: Vec<RankedResult>, page: usize, page_size: usize) -> Vec<RankedResult> {
    // `page` is validated but unbounded; saturate rather than overflow
    // the skip offset.
    let offset = page.saturating_sub(1).saturating_mul(page_size);
    results.into_iter().skip(offset).take(page_size).collect()
}

fn map_embed_error(err: EmbedError) -> RankingError {
    match err {
        EmbedError::InvalidInput(msg) => RankingError::Validation(msg),
        other => RankingError::Transient(other.to_string()),
    }
}

fn remaining(deadline: Instant, operation: &'static str) -> Result<Duration, RankingError> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or(RankingError::Timeout(operation))
}

/// Run a CPU-bound closure on the blocking pool, aborting with a
/// distinct timeout error once the request deadline passes.
async fn run_bounded<T, F>(
    deadline: Instant,
    operation: &'static str,
    f: F,
) -> Result<T, RankingError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let budget = remaining(deadline, operation)?;
    match tokio::time::timeout(budget, task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(RankingError::Internal(join_err.to_string())),
        Err(_) => Err(RankingError::Timeout(operation)),
    }
}
