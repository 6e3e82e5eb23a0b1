use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CorrelationId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    DeadLetter, Delivery, Envelope, MessageChannel, MessagingError, Receipt, Result,
};

/// PostgreSQL-backed durable message channel.
///
/// Messages live in the `messages` table. Leasing uses
/// `FOR UPDATE SKIP LOCKED` so concurrent consumers never lease the same row,
/// and pushes `visible_at` forward by the visibility timeout. The `attempt`
/// column doubles as the lease generation: settling a delivery only succeeds
/// while the row still carries the attempt it was leased with.
#[derive(Clone)]
pub struct PostgresChannel {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PostgresChannel {
    /// Creates a new channel over the given pool.
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_delivery(row: PgRow) -> Result<Delivery> {
        let headers_json: serde_json::Value = row.try_get("headers")?;
        let headers: HashMap<String, String> = serde_json::from_value(headers_json)?;
        let seq: i64 = row.try_get("id")?;
        let attempt = row.try_get::<i32, _>("attempt")? as u32;

        Ok(Delivery {
            envelope: Envelope {
                message_id: row.try_get("message_id")?,
                topic: row.try_get("topic")?,
                payload: row.try_get("payload")?,
                headers,
                enqueued_at: row.try_get("enqueued_at")?,
            },
            attempt,
            receipt: Receipt { seq, attempt },
        })
    }

    fn lease_lost(delivery: &Delivery) -> MessagingError {
        MessagingError::LeaseLost {
            message_id: delivery.envelope.message_id,
            attempt: delivery.attempt,
        }
    }
}

#[async_trait]
impl MessageChannel for PostgresChannel {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let correlation_id = envelope.correlation_id().map(|id| id.as_uuid());
        let headers_json = serde_json::to_value(&envelope.headers)?;

        sqlx::query(
            r#"
            INSERT INTO messages (message_id, topic, correlation_id, payload, headers, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(envelope.message_id)
        .bind(&envelope.topic)
        .bind(correlation_id)
        .bind(&envelope.payload)
        .bind(headers_json)
        .bind(envelope.enqueued_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn receive(&self, topic: &str, max: usize) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            r#"
            UPDATE messages
            SET attempt = attempt + 1,
                visible_at = now() + make_interval(secs => $3)
            WHERE id IN (
                SELECT id FROM messages
                WHERE topic = $1 AND visible_at <= now()
                ORDER BY id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, message_id, topic, payload, headers, attempt, enqueued_at
            "#,
        )
        .bind(topic)
        .bind(max as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = rows
            .into_iter()
            .map(Self::row_to_delivery)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        deliveries.sort_by_key(|d| d.receipt.seq);
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1 AND attempt = $2")
            .bind(delivery.receipt.seq)
            .bind(delivery.receipt.attempt as i32)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Self::lease_lost(delivery));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET visible_at = now() + make_interval(secs => $3)
            WHERE id = $1 AND attempt = $2
            "#,
        )
        .bind(delivery.receipt.seq)
        .bind(delivery.receipt.attempt as i32)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::lease_lost(delivery));
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        // Single statement, so the move is atomic.
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM messages WHERE id = $1 AND attempt = $2
                RETURNING message_id, topic, correlation_id, payload, headers, attempt, enqueued_at
            )
            INSERT INTO dead_letters
                (message_id, topic, correlation_id, payload, headers, attempt, reason, enqueued_at)
            SELECT message_id, topic, correlation_id, payload, headers, attempt, $3, enqueued_at
            FROM moved
            "#,
        )
        .bind(delivery.receipt.seq)
        .bind(delivery.receipt.attempt as i32)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::lease_lost(delivery));
        }
        Ok(())
    }

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, topic, correlation_id, payload, attempt, reason, dead_lettered_at
            FROM dead_letters
            WHERE topic = $1
            ORDER BY id ASC
            "#,
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter> {
                Ok(DeadLetter {
                    message_id: row.try_get("message_id")?,
                    topic: row.try_get("topic")?,
                    correlation_id: row
                        .try_get::<Option<Uuid>, _>("correlation_id")?
                        .map(CorrelationId::from_uuid),
                    payload: row.try_get("payload")?,
                    attempt: row.try_get::<i32, _>("attempt")? as u32,
                    reason: row.try_get("reason")?,
                    dead_lettered_at: row.try_get::<DateTime<Utc>, _>("dead_lettered_at")?,
                })
            })
            .collect()
    }
}
