use async_trait::async_trait;
use common::{CorrelationId, SessionId};
use sqlx::PgPool;

use crate::{
    Advance, CorrelationRegistry, Result, TtlConfig, WorkflowState, WorkflowStateStore,
    mapping_key, status_key,
};

/// PostgreSQL-backed transient store.
///
/// Keys live in the UNLOGGED `transient_kv` table with an `expires_at`
/// column; expired rows read as absent and are swept by [`purge_expired`].
/// The `rank` column carries the workflow status ordering so the monotonic
/// advance is a single conditional upsert.
///
/// [`purge_expired`]: PostgresTransientStore::purge_expired
#[derive(Clone)]
pub struct PostgresTransientStore {
    pool: PgPool,
    ttl: TtlConfig,
}

impl PostgresTransientStore {
    /// Creates a new store over the given pool.
    pub fn new(pool: PgPool, ttl: TtlConfig) -> Self {
        Self { pool, ttl }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Deletes expired rows, returning how many were removed.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transient_kv WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        metrics::counter!("transient_keys_purged_total").increment(result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn get_live(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM transient_kv WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }
}

#[async_trait]
impl WorkflowStateStore for PostgresTransientStore {
    async fn get_state(&self, id: CorrelationId) -> Result<Option<WorkflowState>> {
        let key = status_key(id);
        Ok(self
            .get_live(&key)
            .await?
            .and_then(|value| WorkflowState::decode_lenient(&key, &value)))
    }

    async fn advance(&self, id: CorrelationId, state: WorkflowState) -> Result<Advance> {
        let key = status_key(id);

        let written: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO transient_kv (key, value, rank, expires_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $4))
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                rank = EXCLUDED.rank,
                expires_at = EXCLUDED.expires_at
            WHERE transient_kv.expires_at <= now() OR transient_kv.rank < EXCLUDED.rank
            RETURNING value
            "#,
        )
        .bind(&key)
        .bind(state.encode())
        .bind(state.status().rank())
        .bind(self.ttl.state_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if written.is_some() {
            return Ok(Advance::Applied);
        }

        // The guard rejected the write, so a live row at or beyond `state` exists.
        let Some(value) = self.get_live(&key).await? else {
            return Ok(Advance::Unchanged { current: state });
        };
        if let Some(current) = WorkflowState::decode_lenient(&key, &value) {
            return Ok(Advance::Unchanged { current });
        }

        // Unreadable values are replaced as if expired. The value check keeps
        // a concurrent writer's update intact.
        let replaced = sqlx::query(
            r#"
            UPDATE transient_kv
            SET value = $3, rank = $4, expires_at = now() + make_interval(secs => $5)
            WHERE key = $1 AND value = $2
            "#,
        )
        .bind(&key)
        .bind(&value)
        .bind(state.encode())
        .bind(state.status().rank())
        .bind(self.ttl.state_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        if replaced.rows_affected() > 0 {
            return Ok(Advance::Applied);
        }

        let current = self
            .get_live(&key)
            .await?
            .and_then(|value| WorkflowState::decode_lenient(&key, &value))
            .unwrap_or(state);
        Ok(Advance::Unchanged { current })
    }
}

#[async_trait]
impl CorrelationRegistry for PostgresTransientStore {
    async fn register(&self, id: CorrelationId, session: &SessionId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transient_kv (key, value, rank, expires_at)
            VALUES ($1, $2, 0, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(mapping_key(id))
        .bind(session.as_str())
        .bind(self.ttl.mapping_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve(&self, id: CorrelationId) -> Result<Option<SessionId>> {
        Ok(self.get_live(&mapping_key(id)).await?.map(SessionId::new))
    }
}
