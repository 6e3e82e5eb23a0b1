use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use super::{Backplane, BackplaneMessage, PushError};

const CHANNEL: &str = "order_status";

/// Backplane over PostgreSQL `NOTIFY` / `LISTEN`.
///
/// Every instance sharing the database sees every notification, so a
/// session's connections are reached wherever they are hosted.
#[derive(Clone)]
pub struct PostgresBackplane {
    pool: PgPool,
}

impl PostgresBackplane {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Backplane for PostgresBackplane {
    async fn publish(&self, message: &BackplaneMessage) -> Result<(), PushError> {
        let payload = serde_json::to_string(message)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>, PushError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANNEL).await?;

        let stream = stream::unfold(listener, |mut listener| async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<BackplaneMessage>(notification.payload()) {
                            Ok(message) => return Some((message, listener)),
                            Err(e) => {
                                tracing::warn!(error = %e, "discarding malformed backplane payload");
                            }
                        }
                    }
                    Err(e) => {
                        // The listener reconnects on its next call; notifications
                        // sent in between are lost.
                        tracing::warn!(error = %e, "backplane listener error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
