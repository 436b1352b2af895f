use async_trait::async_trait;
use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tracing::instrument;

use crate::config::{ConfigError, ConfigSource, ScoringConfig};

use super::pool::PgPool;

#[derive(Debug, Error)]
pub enum ConfigStorageError {
    #[error("failed to get connection from pool: {0}")]
    Pool(#[from] PoolError),
    #[error("database error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map tenant config row: {0}")]
    Mapping(String),
}

fn row_to_config(row: &Row) -> Result<ScoringConfig, ConfigStorageError> {
    let tenant_id: String = row
        .try_get("tenant_id")
        .map_err(|e| ConfigStorageError::Mapping(format!("tenant_id: {e}")))?;
    let strategy: String = row
        .try_get("strategy")
        .map_err(|e| ConfigStorageError::Mapping(format!("strategy: {e}")))?;
    let relaxed_semantic_threshold: f32 = row
        .try_get("relaxed_semantic_threshold")
        .map_err(|e| ConfigStorageError::Mapping(format!("relaxed_semantic_threshold: {e}")))?;
    let pool_size: i32 = row
        .try_get("pool_size")
        .map_err(|e| ConfigStorageError::Mapping(format!("pool_size: {e}")))?;

    let strategy = ScoringConfig::resolve_strategy(&tenant_id, &strategy);
    let pool_size = usize::try_from(pool_size.max(1))
        .map_err(|_| ConfigStorageError::Mapping(format!("pool_size {pool_size} out of range")))?;

    Ok(ScoringConfig {
        tenant_id,
        strategy,
        relaxed_semantic_threshold: relaxed_semantic_threshold.clamp(0.0, 1.0),
        pool_size,
    })
}

/// Load one tenant's scoring config. `Ok(None)` means no row; the
/// cache layer resolves that to the documented defaults.
#[instrument(skip(pool))]
pub async fn fetch_scoring_config(
    pool: &PgPool,
    tenant_id: &str,
) -> Result<Option<ScoringConfig>, ConfigStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT tenant_id, strategy, relaxed_semantic_threshold, pool_size
             FROM rank.tenant_configs
             WHERE tenant_id = $1",
            &[&tenant_id.to_string()],
        )
        .await?;

    row.as_ref().map(row_to_config).transpose()
}

/// Postgres-backed `ConfigSource` for the ranking engine's TTL cache.
#[derive(Clone)]
pub struct PgConfigSource {
    pool: PgPool,
}

impl PgConfigSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigSource for PgConfigSource {
    async fn load(&self, tenant_id: &str) -> Result<Option<ScoringConfig>, ConfigError> {
        fetch_scoring_config(&self.pool, tenant_id)
            .await
            .map_err(|e| ConfigError::Store(e.to_string()))
    }
}
