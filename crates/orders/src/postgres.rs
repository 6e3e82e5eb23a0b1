use async_trait::async_trait;
use common::{CorrelationId, OrderLine};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{NewOrder, OrderRepository, PersistedOrder, RepositoryError, Result};

const CORRELATION_CONSTRAINT: &str = "orders_correlation_id_key";

/// PostgreSQL-backed order repository.
///
/// The unique constraint on `orders.correlation_id` is what makes the
/// process stage idempotent: a losing concurrent insert sees the conflict and
/// reads back the winner's row.
#[derive(Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    /// Creates a new PostgreSQL order repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations for every table the service uses.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    async fn load_items(&self, order_id: i64) -> Result<Vec<OrderLine>> {
        let rows = sqlx::query(
            "SELECT product_id, quantity FROM order_items WHERE order_id = $1 ORDER BY line_no",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<OrderLine> {
                Ok(OrderLine::new(
                    row.try_get::<String, _>("product_id")?,
                    row.try_get::<i32, _>("quantity")?,
                ))
            })
            .collect()
    }

    fn row_to_order(row: &PgRow, items: Vec<OrderLine>) -> Result<PersistedOrder> {
        Ok(PersistedOrder {
            order_id: row.try_get("id")?,
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            customer_id: row.try_get("customer_id")?,
            items,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn with_items(&self, row: Option<PgRow>) -> Result<Option<PersistedOrder>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let order_id: i64 = row.try_get("id")?;
        // Items commit with their order row, so they are visible once it is.
        let items = self.load_items(order_id).await?;
        Ok(Some(Self::row_to_order(&row, items)?))
    }
}

fn classify(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        // The correlation key conflict is absorbed by ON CONFLICT; any other
        // constraint failure is permanent.
        if db.constraint().is_some_and(|c| c != CORRELATION_CONSTRAINT)
            || db.is_check_violation()
            || db.is_foreign_key_violation()
        {
            return RepositoryError::Integrity(db.message().to_string());
        }
    }
    RepositoryError::Database(err)
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn find_by_correlation(&self, id: CorrelationId) -> Result<Option<PersistedOrder>> {
        let row = sqlx::query(
            "SELECT id, correlation_id, customer_id, created_at FROM orders WHERE correlation_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        self.with_items(row).await
    }

    async fn insert_or_fetch(&self, order: NewOrder) -> Result<(PersistedOrder, bool)> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (correlation_id, customer_id)
            VALUES ($1, $2)
            ON CONFLICT (correlation_id) DO NOTHING
            RETURNING id, correlation_id, customer_id, created_at
            "#,
        )
        .bind(order.correlation_id.as_uuid())
        .bind(&order.customer_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        let Some(row) = inserted else {
            // Another writer owns this correlation id; read its row instead.
            tx.rollback().await?;
            let existing = self
                .find_by_correlation(order.correlation_id)
                .await?
                .ok_or_else(|| {
                    RepositoryError::Integrity(format!(
                        "order for correlation {} conflicted but could not be read back",
                        order.correlation_id
                    ))
                })?;
            return Ok((existing, false));
        };

        let order_id: i64 = row.try_get("id")?;
        for (line_no, item) in order.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (order_id, line_no, product_id, quantity) VALUES ($1, $2, $3, $4)",
            )
            .bind(order_id)
            .bind(line_no as i32)
            .bind(&item.product_id)
            .bind(item.quantity)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        let persisted = Self::row_to_order(&row, order.items)?;
        tx.commit().await?;
        tracing::debug!(
            order_id,
            correlation_id = %persisted.correlation_id,
            "Inserted order"
        );
        Ok((persisted, true))
    }
}
