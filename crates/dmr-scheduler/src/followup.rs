//! Durable at-least-once queue for follow-up tasks, backed by the data-mart
//! database: a `follow_up_tasks` table leased with `FOR UPDATE SKIP LOCKED`
//! on Postgres, with expired leases reclaimed before every dequeue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dmr_core::{ParamMap, ResourceKey, ScheduledTask, Task};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, SqlitePool};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize)]
struct FollowUpPayload {
    action: String,
    parameters: ParamMap,
    resource_keys: Vec<ResourceKey>,
    allow_collapse: bool,
}

impl FollowUpPayload {
    fn of(task: &Task) -> Self {
        Self {
            action: task.action().to_string(),
            parameters: task.parameters().clone(),
            resource_keys: task.resource_keys().to_vec(),
            allow_collapse: task.allow_collapse(),
        }
    }

    fn into_task(self) -> Task {
        Task::builder(self.action)
            .parameters(self.parameters)
            .resource_keys(self.resource_keys)
            .allow_collapse(self.allow_collapse)
            .build()
    }
}

/// Dialect-abstracted durable store for follow-up tasks. One implementation
/// per database dialect, wired up at startup by configuration.
#[async_trait]
pub trait FollowUpStore: Send + Sync {
    async fn ensure_schema(&self, recreate: bool) -> Result<()>;
    async fn enqueue_follow_up_task(&self, task: &Task) -> Result<()>;
    async fn dequeue_follow_up_tasks(
        &self,
        max: i64,
        lease_duration: Duration,
    ) -> Result<Vec<ScheduledTask>>;
    async fn renew_follow_up_tasks(&self, task_ids: &[i64], lease_duration: Duration) -> Result<()>;
    async fn complete_follow_up_task(&self, task_id: i64) -> Result<()>;
    async fn release_expired_leases(&self) -> Result<u64>;
    async fn count_scheduled_follow_up_tasks(&self) -> Option<u64>;

    /// Operator diagnostic: log one line per row currently sitting in the
    /// follow-up table, leased or not. Returns how many rows were dumped.
    async fn dump_follow_up_table(&self) -> Result<u64>;
}

fn row_to_scheduled_task(
    task_id: i64,
    multiplicity: i64,
    json_text: String,
    expire_lease_at: Option<DateTime<Utc>>,
) -> Result<ScheduledTask> {
    let payload: FollowUpPayload =
        serde_json::from_str(&json_text).map_err(|err| Error::store(format!("decode follow-up row {task_id}: {err}")))?;
    let task = payload.into_task();
    let multiplicity = multiplicity.max(1) as u32;
    Ok(match expire_lease_at {
        Some(expiration) => ScheduledTask::with_follow_up(task, multiplicity, task_id, expiration),
        None => ScheduledTask::with_follow_up(task, multiplicity, task_id, Utc::now()),
    })
}

pub struct SqliteFollowUpStore {
    pool: SqlitePool,
}

impl SqliteFollowUpStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowUpStore for SqliteFollowUpStore {
    async fn ensure_schema(&self, recreate: bool) -> Result<()> {
        if recreate {
            sqlx::query("DROP TABLE IF EXISTS follow_up_tasks")
                .execute(&self.pool)
                .await
                .map_err(|err| Error::store(format!("drop follow_up_tasks: {err}")))?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS follow_up_tasks (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature TEXT NOT NULL,
                allow_collapse_flag INTEGER NOT NULL,
                lease_id TEXT,
                expire_lease_at TIMESTAMP,
                multiplicity INTEGER NOT NULL DEFAULT 1,
                json_text TEXT NOT NULL,
                created_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("create follow_up_tasks: {err}")))?;

        Ok(())
    }

    async fn enqueue_follow_up_task(&self, task: &Task) -> Result<()> {
        let payload = FollowUpPayload::of(task);
        let json_text = serde_json::to_string(&payload)
            .map_err(|err| Error::store(format!("encode follow-up task: {err}")))?;
        let signature = task.signature();

        if task.allow_collapse() {
            let updated = sqlx::query(
                "UPDATE follow_up_tasks SET multiplicity = multiplicity + 1
                 WHERE signature = ? AND allow_collapse_flag = 1 AND lease_id IS NULL",
            )
            .bind(signature)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::store(format!("collapse follow-up task: {err}")))?
            .rows_affected();

            match updated {
                0 => {}
                1 => return Ok(()),
                n => {
                    error!(signature, rows = n, "follow-up collapse updated more than one row");
                    return Err(Error::store("follow-up collapse invariant violated: >1 row updated"));
                }
            }
        }

        sqlx::query(
            "INSERT INTO follow_up_tasks (signature, allow_collapse_flag, multiplicity, json_text)
             VALUES (?, ?, 1, ?)",
        )
        .bind(signature)
        .bind(task.allow_collapse())
        .bind(json_text)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("insert follow-up task: {err}")))?;

        Ok(())
    }

    async fn dequeue_follow_up_tasks(
        &self,
        max: i64,
        lease_duration: Duration,
    ) -> Result<Vec<ScheduledTask>> {
        self.release_expired_leases().await?;

        let lease_id = Uuid::new_v4().to_string();
        let expire_at = Utc::now() + chrono::Duration::milliseconds(lease_duration.as_millis() as i64);

        sqlx::query(
            "UPDATE follow_up_tasks SET lease_id = ?, expire_lease_at = ?
             WHERE task_id IN (
                 SELECT task_id FROM follow_up_tasks WHERE lease_id IS NULL ORDER BY task_id LIMIT ?
             )",
        )
        .bind(&lease_id)
        .bind(expire_at)
        .bind(max)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("lease follow-up tasks: {err}")))?;

        let rows = sqlx::query(
            "SELECT task_id, multiplicity, json_text, expire_lease_at FROM follow_up_tasks WHERE lease_id = ?",
        )
        .bind(&lease_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::store(format!("select leased follow-up tasks: {err}")))?;

        rows.into_iter()
            .map(|row| {
                row_to_scheduled_task(
                    row.try_get("task_id").map_err(|e| Error::store(e.to_string()))?,
                    row.try_get("multiplicity").map_err(|e| Error::store(e.to_string()))?,
                    row.try_get("json_text").map_err(|e| Error::store(e.to_string()))?,
                    row.try_get("expire_lease_at").map_err(|e| Error::store(e.to_string()))?,
                )
            })
            .collect()
    }

    async fn renew_follow_up_tasks(&self, task_ids: &[i64], lease_duration: Duration) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let expire_at = Utc::now() + chrono::Duration::milliseconds(lease_duration.as_millis() as i64);
        for task_id in task_ids {
            sqlx::query("UPDATE follow_up_tasks SET expire_lease_at = ? WHERE task_id = ?")
                .bind(expire_at)
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(|err| Error::store(format!("renew follow-up lease: {err}")))?;
        }
        Ok(())
    }

    async fn complete_follow_up_task(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM follow_up_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::store(format!("complete follow-up task: {err}")))?;
        Ok(())
    }

    async fn release_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE follow_up_tasks SET lease_id = NULL, expire_lease_at = NULL
             WHERE expire_lease_at IS NOT NULL AND expire_lease_at < ?",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("release expired leases: {err}")))?;
        Ok(result.rows_affected())
    }

    async fn count_scheduled_follow_up_tasks(&self) -> Option<u64> {
        sqlx::query("SELECT COUNT(*) AS n FROM follow_up_tasks")
            .fetch_one(&self.pool)
            .await
            .ok()
            .and_then(|row| row.try_get::<i64, _>("n").ok())
            .map(|n| n.max(0) as u64)
    }

    async fn dump_follow_up_table(&self) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT task_id, signature, lease_id, expire_lease_at, multiplicity FROM follow_up_tasks ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::store(format!("dump follow_up_tasks: {err}")))?;

        for row in &rows {
            let task_id: i64 = row.try_get("task_id").map_err(|e| Error::store(e.to_string()))?;
            let signature: String = row.try_get("signature").map_err(|e| Error::store(e.to_string()))?;
            let lease_id: Option<String> = row.try_get("lease_id").map_err(|e| Error::store(e.to_string()))?;
            let expire_lease_at: Option<DateTime<Utc>> =
                row.try_get("expire_lease_at").map_err(|e| Error::store(e.to_string()))?;
            let multiplicity: i64 = row.try_get("multiplicity").map_err(|e| Error::store(e.to_string()))?;
            info!(
                task_id,
                signature,
                leased = lease_id.is_some(),
                ?expire_lease_at,
                multiplicity,
                "follow-up table row"
            );
        }

        Ok(rows.len() as u64)
    }
}

pub struct PostgresFollowUpStore {
    pool: PgPool,
}

impl PostgresFollowUpStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowUpStore for PostgresFollowUpStore {
    async fn ensure_schema(&self, recreate: bool) -> Result<()> {
        if recreate {
            sqlx::query("DROP TABLE IF EXISTS follow_up_tasks")
                .execute(&self.pool)
                .await
                .map_err(|err| Error::store(format!("drop follow_up_tasks: {err}")))?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS follow_up_tasks (
                task_id BIGSERIAL PRIMARY KEY,
                signature TEXT NOT NULL,
                allow_collapse_flag BOOLEAN NOT NULL,
                lease_id TEXT,
                expire_lease_at TIMESTAMPTZ,
                multiplicity INTEGER NOT NULL DEFAULT 1,
                json_text TEXT NOT NULL,
                created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
                modified_on TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("create follow_up_tasks: {err}")))?;

        Ok(())
    }

    async fn enqueue_follow_up_task(&self, task: &Task) -> Result<()> {
        let payload = FollowUpPayload::of(task);
        let json_text = serde_json::to_string(&payload)
            .map_err(|err| Error::store(format!("encode follow-up task: {err}")))?;
        let signature = task.signature();

        if task.allow_collapse() {
            let updated = sqlx::query(
                "UPDATE follow_up_tasks SET multiplicity = multiplicity + 1
                 WHERE signature = $1 AND allow_collapse_flag = true AND lease_id IS NULL",
            )
            .bind(signature)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::store(format!("collapse follow-up task: {err}")))?
            .rows_affected();

            match updated {
                0 => {}
                1 => return Ok(()),
                n => {
                    error!(signature, rows = n, "follow-up collapse updated more than one row");
                    return Err(Error::store("follow-up collapse invariant violated: >1 row updated"));
                }
            }
        }

        sqlx::query(
            "INSERT INTO follow_up_tasks (signature, allow_collapse_flag, multiplicity, json_text)
             VALUES ($1, $2, 1, $3)",
        )
        .bind(signature)
        .bind(task.allow_collapse())
        .bind(json_text)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("insert follow-up task: {err}")))?;

        Ok(())
    }

    async fn dequeue_follow_up_tasks(
        &self,
        max: i64,
        lease_duration: Duration,
    ) -> Result<Vec<ScheduledTask>> {
        self.release_expired_leases().await?;

        let lease_id = Uuid::new_v4().to_string();
        let expire_at = Utc::now() + chrono::Duration::milliseconds(lease_duration.as_millis() as i64);

        let rows = sqlx::query(
            "WITH picked AS (
                 SELECT task_id FROM follow_up_tasks
                 WHERE lease_id IS NULL
                 ORDER BY task_id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE follow_up_tasks AS f
             SET lease_id = $2, expire_lease_at = $3
             FROM picked
             WHERE f.task_id = picked.task_id
             RETURNING f.task_id, f.multiplicity, f.json_text, f.expire_lease_at",
        )
        .bind(max)
        .bind(&lease_id)
        .bind(expire_at)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::store(format!("lease follow-up tasks: {err}")))?;

        rows.into_iter()
            .map(|row| {
                row_to_scheduled_task(
                    row.try_get("task_id").map_err(|e| Error::store(e.to_string()))?,
                    row.try_get("multiplicity").map_err(|e| Error::store(e.to_string()))?,
                    row.try_get("json_text").map_err(|e| Error::store(e.to_string()))?,
                    row.try_get("expire_lease_at").map_err(|e| Error::store(e.to_string()))?,
                )
            })
            .collect()
    }

    async fn renew_follow_up_tasks(&self, task_ids: &[i64], lease_duration: Duration) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let expire_at = Utc::now() + chrono::Duration::milliseconds(lease_duration.as_millis() as i64);
        sqlx::query("UPDATE follow_up_tasks SET expire_lease_at = $1 WHERE task_id = ANY($2)")
            .bind(expire_at)
            .bind(task_ids)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::store(format!("renew follow-up leases: {err}")))?;
        Ok(())
    }

    async fn complete_follow_up_task(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM follow_up_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::store(format!("complete follow-up task: {err}")))?;
        Ok(())
    }

    async fn release_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE follow_up_tasks SET lease_id = NULL, expire_lease_at = NULL
             WHERE expire_lease_at IS NOT NULL AND expire_lease_at < $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| Error::store(format!("release expired leases: {err}")))?;
        Ok(result.rows_affected())
    }

    async fn count_scheduled_follow_up_tasks(&self) -> Option<u64> {
        sqlx::query("SELECT COUNT(*) AS n FROM follow_up_tasks")
            .fetch_one(&self.pool)
            .await
            .ok()
            .and_then(|row| row.try_get::<i64, _>("n").ok())
            .map(|n| n.max(0) as u64)
    }

    async fn dump_follow_up_table(&self) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT task_id, signature, lease_id, expire_lease_at, multiplicity FROM follow_up_tasks ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::store(format!("dump follow_up_tasks: {err}")))?;

        for row in &rows {
            let task_id: i64 = row.try_get("task_id").map_err(|e| Error::store(e.to_string()))?;
            let signature: String = row.try_get("signature").map_err(|e| Error::store(e.to_string()))?;
            let lease_id: Option<String> = row.try_get("lease_id").map_err(|e| Error::store(e.to_string()))?;
            let expire_lease_at: Option<DateTime<Utc>> =
                row.try_get("expire_lease_at").map_err(|e| Error::store(e.to_string()))?;
            let multiplicity: i64 = row.try_get("multiplicity").map_err(|e| Error::store(e.to_string()))?;
            info!(
                task_id,
                signature,
                leased = lease_id.is_some(),
                ?expire_lease_at,
                multiplicity,
                "follow-up table row"
            );
        }

        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_core::TaskBuilder;

    async fn store() -> SqliteFollowUpStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = SqliteFollowUpStore::new(pool);
        store.ensure_schema(false).await.unwrap();
        store
    }

    fn task() -> Task {
        TaskBuilder::new("F")
            .resource_key(ResourceKey::single("ENTITY", "1"))
            .allow_collapse(true)
            .build()
    }

    #[tokio::test]
    async fn three_collapsible_enqueues_become_one_row_with_multiplicity_three() {
        let store = store().await;
        store.enqueue_follow_up_task(&task()).await.unwrap();
        store.enqueue_follow_up_task(&task()).await.unwrap();
        store.enqueue_follow_up_task(&task()).await.unwrap();

        let leased = store
            .dequeue_follow_up_tasks(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].multiplicity(), 3);
    }

    #[tokio::test]
    async fn leased_row_is_invisible_to_further_dequeues() {
        let store = store().await;
        store.enqueue_follow_up_task(&task()).await.unwrap();

        let first = store
            .dequeue_follow_up_tasks(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .dequeue_follow_up_tasks(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn completing_a_task_removes_its_row() {
        let store = store().await;
        store.enqueue_follow_up_task(&task()).await.unwrap();
        let leased = store
            .dequeue_follow_up_tasks(10, Duration::from_secs(30))
            .await
            .unwrap();

        store
            .complete_follow_up_task(leased[0].follow_up_id().unwrap())
            .await
            .unwrap();

        assert_eq!(store.count_scheduled_follow_up_tasks().await, Some(0));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let store = store().await;
        store.enqueue_follow_up_task(&task()).await.unwrap();

        let leased = store
            .dequeue_follow_up_tasks(10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        // immediate expiry: next dequeue should reclaim the same row.

        let reclaimed = store
            .dequeue_follow_up_tasks(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1, "a row whose lease already expired must be reclaimed");
    }

    #[tokio::test]
    async fn dump_reports_every_row_regardless_of_lease_state() {
        let store = store().await;
        store.enqueue_follow_up_task(&task()).await.unwrap();
        store.enqueue_follow_up_task(&task()).await.unwrap();
        store.dequeue_follow_up_tasks(10, Duration::from_secs(30)).await.unwrap();

        assert_eq!(store.dump_follow_up_table().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dump_of_an_empty_table_reports_zero() {
        let store = store().await;
        assert_eq!(store.dump_follow_up_table().await.unwrap(), 0);
    }
}
