use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Row;
use tokio_postgres::Error as PgError;
use tokio_postgres::types::ToSql;
use tracing::{info, instrument};

use crate::ranking::{CandidateSource, CandidateSourceError};
use crate::{CandidateProfile, EmbeddingMeta};

use super::pool::PgPool;

#[derive(Debug, Error)]
pub enum CandidateStorageError {
    #[error("failed to get connection from pool: {0}")]
    Pool(#[from] PoolError),
    #[error("database error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map candidate row: {0}")]
    Mapping(String),
}

const PROFILE_COLUMNS: &str = "id, tenant_id, title, skills, body, active, \
     embedding, embedding_model, embedding_generated_at, embedding_token_count, updated_at";

fn row_to_profile(row: &Row) -> Result<CandidateProfile, CandidateStorageError> {
    let embedding: Option<Vec<f32>> = row
        .try_get("embedding")
        .map_err(|e| CandidateStorageError::Mapping(format!("embedding: {e}")))?;

    let model: Option<String> = row
        .try_get("embedding_model")
        .map_err(|e| CandidateStorageError::Mapping(format!("embedding_model: {e}")))?;
    let generated_at: Option<DateTime<Utc>> = row
        .try_get("embedding_generated_at")
        .map_err(|e| CandidateStorageError::Mapping(format!("embedding_generated_at: {e}")))?;
    let token_count: Option<i32> = row
        .try_get("embedding_token_count")
        .map_err(|e| CandidateStorageError::Mapping(format!("embedding_token_count: {e}")))?;

    // Metadata columns are written together with the vector; treat a
    // partially populated triple as no metadata.
    let embedding_meta = match (model, generated_at, token_count) {
        (Some(model_id), Some(generated_at), Some(token_count)) => Some(EmbeddingMeta {
            model_id,
            generated_at,
            token_count,
        }),
        _ => None,
    };

    Ok(CandidateProfile {
        id: row
            .try_get("id")
            .map_err(|e| CandidateStorageError::Mapping(format!("id: {e}")))?,
        tenant_id: row
            .try_get("tenant_id")
            .map_err(|e| CandidateStorageError::Mapping(format!("tenant_id: {e}")))?,
        title: row
            .try_get("title")
            .map_err(|e| CandidateStorageError::Mapping(format!("title: {e}")))?,
        skills: row
            .try_get("skills")
            .map_err(|e| CandidateStorageError::Mapping(format!("skills: {e}")))?,
        body: row
            .try_get("body")
            .map_err(|e| CandidateStorageError::Mapping(format!("body: {e}")))?,
        active: row
            .try_get("active")
            .map_err(|e| CandidateStorageError::Mapping(format!("active: {e}")))?,
        embedding,
        embedding_meta,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| CandidateStorageError::Mapping(format!("updated_at: {e}")))?,
    })
}

/// Bulk fetch by id. Order of the result is unspecified; callers key by id.
#[instrument(skip(pool, ids), fields(count = ids.len()))]
pub async fn fetch_profiles_by_ids(
    pool: &PgPool,
    ids: &[i64],
) -> Result<Vec<CandidateProfile>, CandidateStorageError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let client = pool.get().await?;
    let ids: Vec<i64> = ids.to_vec();
    let rows = client
        .query(
            &format!("SELECT {PROFILE_COLUMNS} FROM rank.candidates WHERE id = ANY($1)"),
            &[&ids],
        )
        .await?;

    rows.iter().map(row_to_profile).collect()
}

/// Store a freshly generated embedding. The vector and its metadata are
/// replaced as one atomic UPDATE keyed by candidate id, so readers see
/// either the previous embedding or the new one, never a mix.
#[instrument(skip(pool, vector), fields(dimension = vector.len()))]
pub async fn overwrite_embedding(
    pool: &PgPool,
    candidate_id: i64,
    vector: &[f32],
    meta: &EmbeddingMeta,
) -> Result<bool, CandidateStorageError> {
    let client = pool.get().await?;
    let vector: Vec<f32> = vector.to_vec();
    let updated = client
        .execute(
            "UPDATE rank.candidates
             SET embedding = $2,
                 embedding_model = $3,
                 embedding_generated_at = $4,
                 embedding_token_count = $5,
                 updated_at = NOW()
             WHERE id = $1",
            &[
                &candidate_id,
                &vector,
                &meta.model_id,
                &meta.generated_at,
                &meta.token_count,
            ],
        )
        .await?;

    if updated == 0 {
        info!(candidate_id, "embedding overwrite skipped; candidate row no longer exists");
    }
    Ok(updated > 0)
}

/// Case-insensitive substring search over title, skills and body for
/// active candidates of one tenant. Backs the last-resort ranking
/// fallback, so it must reach candidates that have no embedding yet.
#[instrument(skip(pool, keywords), fields(keywords = keywords.len()))]
pub async fn search_profiles_by_keywords(
    pool: &PgPool,
    tenant_id: &str,
    keywords: &[String],
    limit: usize,
) -> Result<Vec<CandidateProfile>, CandidateStorageError> {
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    let client = pool.get().await?;

    let tenant = tenant_id.to_string();
    let patterns: Vec<String> = keywords.iter().map(|k| like_pattern(k)).collect();
    let limit = i64::try_from(limit.max(1))
        .map_err(|_| CandidateStorageError::Mapping("limit out of range".into()))?;

    let mut sql = format!(
        "SELECT {PROFILE_COLUMNS} FROM rank.candidates \
         WHERE tenant_id = $1 AND active AND ("
    );
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(tenant)];
    for (i, pattern) in patterns.into_iter().enumerate() {
        if i > 0 {
            sql.push_str(" OR ");
        }
        let placeholder = params.len() + 1;
        sql.push_str(&format!(
            "(title ILIKE ${placeholder} OR body ILIKE ${placeholder} \
             OR array_to_string(skills, ' ') ILIKE ${placeholder})"
        ));
        params.push(Box::new(pattern));
    }
    let placeholder = params.len() + 1;
    sql.push_str(&format!(") ORDER BY id LIMIT ${placeholder}"));
    params.push(Box::new(limit));

    let param_refs: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
    let rows = client.query(&sql, &param_refs).await?;

    rows.iter().map(row_to_profile).collect()
}

/// Stream every stored embedding for warm-up of the in-memory vector
/// index: (candidate id, tenant id, vector, active).
#[instrument(skip(pool))]
pub async fn fetch_embedding_rows(
    pool: &PgPool,
) -> Result<Vec<(i64, String, Vec<f32>, bool)>, CandidateStorageError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT id, tenant_id, embedding, active
             FROM rank.candidates
             WHERE embedding IS NOT NULL",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("id")
                    .map_err(|e| CandidateStorageError::Mapping(format!("id: {e}")))?,
                row.try_get("tenant_id")
                    .map_err(|e| CandidateStorageError::Mapping(format!("tenant_id: {e}")))?,
                row.try_get("embedding")
                    .map_err(|e| CandidateStorageError::Mapping(format!("embedding: {e}")))?,
                row.try_get("active")
                    .map_err(|e| CandidateStorageError::Mapping(format!("active: {e}")))?,
            ))
        })
        .collect()
}

fn like_pattern(keyword: &str) -> String {
    let escaped = keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Postgres-backed candidate reads for the ranking orchestrator.
#[derive(Clone)]
pub struct PgCandidateSource {
    pool: PgPool,
}

impl PgCandidateSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateSource for PgCandidateSource {
    async fn fetch_by_ids(
        &self,
        ids: &[i64],
    ) -> Result<Vec<CandidateProfile>, CandidateSourceError> {
        fetch_profiles_by_ids(&self.pool, ids)
            .await
            .map_err(|e| CandidateSourceError::Lookup(e.to_string()))
    }

    async fn search_text(
        &self,
        tenant_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<CandidateProfile>, CandidateSourceError> {
        search_profiles_by_keywords(&self.pool, tenant_id, keywords, limit)
            .await
            .map_err(|e| CandidateSourceError::Lookup(e.to_string()))
    }
}
