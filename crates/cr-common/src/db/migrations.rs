use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

use super::pool::PgPool;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get connection from pool: {0}")]
    Pool(#[from] PoolError),
    #[error("database error: {0}")]
    Postgres(#[from] PgError),
}

struct Migration {
    id: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "create rank schema and candidates table",
        sql: r#"
            CREATE SCHEMA IF NOT EXISTS rank;

            CREATE TABLE IF NOT EXISTS rank.candidates (
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                skills TEXT[] NOT NULL DEFAULT '{}',
                body TEXT NOT NULL DEFAULT '',
                active BOOLEAN NOT NULL DEFAULT TRUE,
                embedding REAL[],
                embedding_model TEXT,
                embedding_generated_at TIMESTAMPTZ,
                embedding_token_count INTEGER,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_tenant_active
                ON rank.candidates (tenant_id, active);
        "#,
    },
    Migration {
        id: 2,
        description: "create embedding job queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rank.embedding_queue (
                id BIGSERIAL PRIMARY KEY,
                candidate_id BIGINT NOT NULL,
                profile_text TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                queued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                next_retry_at TIMESTAMPTZ,
                locked_by TEXT,
                processing_started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                last_error TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT chk_embedding_queue_status CHECK (
                    status IN ('pending', 'processing', 'completed', 'failed', 'dead_letter')
                ),
                CONSTRAINT chk_embedding_queue_retries CHECK (
                    retry_count >= 0 AND retry_count <= max_retries
                )
            );

            CREATE INDEX IF NOT EXISTS idx_embedding_queue_pending
                ON rank.embedding_queue (queued_at, id)
                WHERE status = 'pending';

            CREATE INDEX IF NOT EXISTS idx_embedding_queue_status
                ON rank.embedding_queue (status, updated_at);

            CREATE INDEX IF NOT EXISTS idx_embedding_queue_candidate
                ON rank.embedding_queue (candidate_id, queued_at DESC);
        "#,
    },
    Migration {
        id: 3,
        description: "create tenant scoring config table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rank.tenant_configs (
                tenant_id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL DEFAULT 'tiered',
                relaxed_semantic_threshold REAL NOT NULL DEFAULT 0.3,
                pool_size INTEGER NOT NULL DEFAULT 100,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        "#,
    },
];

/// Apply any pending schema migrations. Each migration runs in its own
/// transaction together with its bookkeeping row, so a failed migration
/// leaves the database at the previous version.
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrationError> {
    let mut client = pool.get().await?;

    client
        .batch_execute(
            r#"
            CREATE SCHEMA IF NOT EXISTS rank;
            CREATE TABLE IF NOT EXISTS rank.schema_migrations (
                id BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .await?;

    for migration in MIGRATIONS {
        let already_applied = client
            .query_opt(
                "SELECT id FROM rank.schema_migrations WHERE id = $1",
                &[&migration.id],
            )
            .await?
            .is_some();
        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO rank.schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        info!(
            migration_id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_ids_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[test]
    fn migration_sql_is_idempotent_by_construction() {
        for migration in MIGRATIONS {
            assert!(
                migration.sql.contains("IF NOT EXISTS"),
                "migration {} should be re-runnable",
                migration.id
            );
        }
    }
}
