//! SQL-backed [`MessageConsumer`] against table `sz_message_queue`, leasing
//! rows with `FOR UPDATE SKIP LOCKED` on Postgres and relying on SQLite's
//! single-writer lock where row-level locking isn't available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, SqlitePool};
use tracing::error;
use uuid::Uuid;

use crate::{Error, MessageConsumer, MessageHandler, QueueMessage, Result, ShutdownFlag};

/// The pool backing the SQL queue, one dialect per variant.
#[derive(Clone)]
pub enum SqlPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

#[derive(Clone)]
pub struct SqlConfig {
    pub pool: SqlPool,
    pub lease_seconds: i64,
}

impl SqlConfig {
    pub fn new(pool: SqlPool) -> Self {
        Self {
            pool,
            lease_seconds: 30,
        }
    }
}

pub struct SqlConsumer {
    config: SqlConfig,
    shutdown: ShutdownFlag,
}

impl SqlConsumer {
    pub fn new(config: SqlConfig) -> Self {
        Self {
            config,
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Idempotent: create `sz_message_queue` if it does not already exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        match &self.config.pool {
            SqlPool::Sqlite(pool) => {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS sz_message_queue (
                        message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                        message_text TEXT NOT NULL,
                        lease_id TEXT,
                        expire_lease_at TIMESTAMP
                    )",
                )
                .execute(pool)
                .await
                .map_err(|err| Error::transport(format!("ensure_schema: {err}")))?;
            }
            SqlPool::Postgres(pool) => {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS sz_message_queue (
                        message_id BIGSERIAL PRIMARY KEY,
                        message_text TEXT NOT NULL,
                        lease_id TEXT,
                        expire_lease_at TIMESTAMPTZ
                    )",
                )
                .execute(pool)
                .await
                .map_err(|err| Error::transport(format!("ensure_schema: {err}")))?;
            }
        }
        Ok(())
    }

    pub async fn publish(&self, message_text: &str) -> Result<()> {
        match &self.config.pool {
            SqlPool::Sqlite(pool) => {
                sqlx::query("INSERT INTO sz_message_queue (message_text) VALUES (?)")
                    .bind(message_text)
                    .execute(pool)
                    .await
                    .map(|_| ())
            }
            SqlPool::Postgres(pool) => {
                sqlx::query("INSERT INTO sz_message_queue (message_text) VALUES ($1)")
                    .bind(message_text)
                    .execute(pool)
                    .await
                    .map(|_| ())
            }
        }
        .map_err(|err| Error::transport(format!("publish: {err}")))?;
        Ok(())
    }

    async fn release_expired_leases(&self) -> Result<()> {
        let now = Utc::now();
        match &self.config.pool {
            SqlPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE sz_message_queue SET lease_id = NULL, expire_lease_at = NULL
                     WHERE expire_lease_at IS NOT NULL AND expire_lease_at < ?",
                )
                .bind(now)
                .execute(pool)
                .await
                .map(|_| ())
            }
            SqlPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE sz_message_queue SET lease_id = NULL, expire_lease_at = NULL
                     WHERE expire_lease_at IS NOT NULL AND expire_lease_at < $1",
                )
                .bind(now)
                .execute(pool)
                .await
                .map(|_| ())
            }
        }
        .map_err(|err| Error::transport(format!("release_expired_leases: {err}")))?;
        Ok(())
    }

    async fn lease_batch(&self, max: i64) -> Result<Vec<QueueMessage>> {
        self.release_expired_leases().await?;

        let lease_id = Uuid::new_v4().to_string();
        let expire_at: DateTime<Utc> = Utc::now() + chrono::Duration::seconds(self.config.lease_seconds);

        let rows: Vec<(i64, String)> = match &self.config.pool {
            SqlPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE sz_message_queue SET lease_id = ?, expire_lease_at = ?
                     WHERE message_id IN (
                         SELECT message_id FROM sz_message_queue
                         WHERE lease_id IS NULL ORDER BY message_id LIMIT ?
                     )",
                )
                .bind(&lease_id)
                .bind(expire_at)
                .bind(max)
                .execute(pool)
                .await
                .map_err(|err| Error::transport(format!("lease update: {err}")))?;

                let leased = sqlx::query("SELECT message_id, message_text FROM sz_message_queue WHERE lease_id = ?")
                    .bind(&lease_id)
                    .fetch_all(pool)
                    .await
                    .map_err(|err| Error::transport(format!("lease select: {err}")))?;
                leased
                    .into_iter()
                    .map(|row| Ok((row.try_get("message_id")?, row.try_get("message_text")?)))
                    .collect::<std::result::Result<_, sqlx::Error>>()
                    .map_err(|err| Error::transport(format!("lease decode: {err}")))?
            }
            SqlPool::Postgres(pool) => {
                let leased = sqlx::query(
                    "WITH picked AS (
                         SELECT message_id FROM sz_message_queue
                         WHERE lease_id IS NULL
                         ORDER BY message_id
                         LIMIT $1
                         FOR UPDATE SKIP LOCKED
                     )
                     UPDATE sz_message_queue AS m
                     SET lease_id = $2, expire_lease_at = $3
                     FROM picked
                     WHERE m.message_id = picked.message_id
                     RETURNING m.message_id, m.message_text",
                )
                .bind(max)
                .bind(&lease_id)
                .bind(expire_at)
                .fetch_all(pool)
                .await
                .map_err(|err| Error::transport(format!("lease update: {err}")))?;
                leased
                    .into_iter()
                    .map(|row| Ok((row.try_get("message_id")?, row.try_get("message_text")?)))
                    .collect::<std::result::Result<_, sqlx::Error>>()
                    .map_err(|err| Error::transport(format!("lease decode: {err}")))?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(message_id, message_text)| {
                let payload = serde_json::from_str(&message_text)
                    .unwrap_or_else(|_| serde_json::Value::String(message_text.clone()));
                QueueMessage {
                    message_id: message_id.to_string(),
                    ack_token: message_id.to_string(),
                    payload,
                    deliveries: 1,
                }
            })
            .collect())
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        let message_id: i64 = ack_token
            .parse()
            .map_err(|_| Error::transport(format!("invalid ack_token `{ack_token}`")))?;

        match &self.config.pool {
            SqlPool::Sqlite(pool) => {
                sqlx::query("DELETE FROM sz_message_queue WHERE message_id = ?")
                    .bind(message_id)
                    .execute(pool)
                    .await
                    .map(|_| ())
            }
            SqlPool::Postgres(pool) => {
                sqlx::query("DELETE FROM sz_message_queue WHERE message_id = $1")
                    .bind(message_id)
                    .execute(pool)
                    .await
                    .map(|_| ())
            }
        }
        .map_err(|err| Error::transport(format!("ack: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer for SqlConsumer {
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        while !self.shutdown.is_raised() {
            let messages = self.lease_batch(10).await?;

            if messages.is_empty() {
                self.shutdown.sleep_or_raised(Duration::from_millis(200)).await;
                continue;
            }

            for message in messages {
                if self.shutdown.is_raised() {
                    break;
                }
                let success = handler.handle(message.payload.clone()).await;
                if success {
                    if let Err(err) = self.ack(&message.ack_token).await {
                        error!(%err, message_id = %message.message_id, "failed to ack sql queue message");
                    }
                }
                // On failure, the leased row is simply left in place; its
                // lease expires and the row becomes leasable again.
            }
        }

        Ok(())
    }

    fn destroy(&self) {
        self.shutdown.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_consumer() -> SqlConsumer {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let consumer = SqlConsumer::new(SqlConfig::new(SqlPool::Sqlite(pool)));
        consumer.ensure_schema().await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn publish_then_lease_returns_the_row() {
        let consumer = sqlite_consumer().await;
        consumer.publish(r#"{"entityId":100}"#).await.unwrap();

        let leased = consumer.lease_batch(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].payload["entityId"], 100);

        let again = consumer.lease_batch(10).await.unwrap();
        assert!(again.is_empty(), "leased row must not be leasable again");
    }

    #[tokio::test]
    async fn ack_removes_the_row() {
        let consumer = sqlite_consumer().await;
        consumer.publish(r#"{"k":"v"}"#).await.unwrap();

        let leased = consumer.lease_batch(10).await.unwrap();
        consumer.ack(&leased[0].ack_token).await.unwrap();

        consumer.release_expired_leases().await.unwrap();
        let leased_again = consumer.lease_batch(10).await.unwrap();
        assert!(leased_again.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_becomes_leasable_again() {
        let mut consumer = sqlite_consumer().await;
        consumer.config.lease_seconds = -1;
        consumer.publish(r#"{"k":"v"}"#).await.unwrap();

        let first = consumer.lease_batch(10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = consumer.lease_batch(10).await.unwrap();
        assert_eq!(second.len(), 1, "a lease already in the past must be reclaimed");
    }
}
