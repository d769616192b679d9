//! Turns a dispatched task's action and parameters into one upsert against
//! the data mart.

use async_trait::async_trait;
use dmr_core::{ParamMap, ParamValue};
use dmr_scheduler::{FollowUpScheduler, TaskHandler};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::datamart::{DataMartPool, StatKey, Statistic};

pub const ACTION_APPLY: &str = "APPLY";
pub const ACTION_RETIRE: &str = "RETIRE";

/// Applies a single affected-entity task: `APPLY` adds one count to each of
/// the statistics named in its parameters, `RETIRE` subtracts one. Which
/// statistics move, and by how much, is decided upstream by
/// [`crate::ingest::IngestHandler`] and carried as task parameters rather
/// than recomputed here, since recomputing it would mean querying the
/// entity-resolution engine, which is out of scope for this process.
pub struct DataMartHandler {
    pool: DataMartPool,
}

impl DataMartHandler {
    pub fn new(pool: DataMartPool) -> Self {
        Self { pool }
    }

    fn string_param(parameters: &ParamMap, key: &str) -> String {
        match parameters.get(key) {
            Some(ParamValue::String(value)) => value.clone(),
            _ => String::new(),
        }
    }

    fn statistics_param(parameters: &ParamMap) -> Vec<Statistic> {
        match parameters.get("statistics") {
            Some(ParamValue::List(items)) => items
                .iter()
                .filter_map(|item| match item {
                    ParamValue::String(name) => Statistic::parse(name),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl TaskHandler for DataMartHandler {
    async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pool.ping().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn handle_task(
        &self,
        action: &str,
        parameters: &ParamMap,
        multiplicity: u32,
        _follow_ups: &FollowUpScheduler,
    ) -> bool {
        let delta: i64 = match action {
            ACTION_APPLY => i64::from(multiplicity.max(1)),
            ACTION_RETIRE => -i64::from(multiplicity.max(1)),
            other => {
                warn!(action = other, "unrecognized action, dropping task");
                return false;
            }
        };

        let data_source_1 = Self::string_param(parameters, "dataSource1");
        let data_source_2 = Self::string_param(parameters, "dataSource2");
        let match_key = Self::string_param(parameters, "matchKey");
        let principle = Self::string_param(parameters, "principle");
        let statistics = Self::statistics_param(parameters);

        if statistics.is_empty() {
            warn!("task carried no statistics to update");
            return false;
        }

        for statistic in statistics {
            let key = StatKey {
                data_source_1: data_source_1.clone(),
                data_source_2: data_source_2.clone(),
                match_key: match_key.clone(),
                principle: principle.clone(),
                statistic,
            };
            if let Err(err) = self.pool.apply_delta(&key, delta).await {
                warn!(error = %err, "failed to apply data mart delta");
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_core::ParamsBuilder;
    use dmr_scheduler::FollowUpStore;
    use sqlx::SqlitePool;

    async fn pool() -> DataMartPool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE data_mart_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_source_1 TEXT NOT NULL,
                data_source_2 TEXT NOT NULL DEFAULT '',
                match_key TEXT NOT NULL DEFAULT '',
                principle TEXT NOT NULL DEFAULT '',
                statistic TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                UNIQUE (data_source_1, data_source_2, match_key, principle, statistic)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        DataMartPool::Sqlite(pool)
    }

    fn params(statistics: &[&str]) -> ParamMap {
        let mut builder = ParamsBuilder::new()
            .set("dataSource1", "CUSTOMERS")
            .unwrap()
            .set("dataSource2", "")
            .unwrap()
            .set("matchKey", "")
            .unwrap()
            .set("principle", "")
            .unwrap();
        let list = statistics
            .iter()
            .fold(dmr_core::ListBuilder::new(), |list, name| {
                list.push(*name)
            });
        builder = builder.set("statistics", list.build()).unwrap();
        builder.build()
    }

    #[tokio::test]
    async fn apply_increments_each_named_statistic_by_multiplicity() {
        let handler = DataMartHandler::new(pool().await);
        let scheduler = test_follow_up_scheduler().await;
        let ok = handler
            .handle_task(
                ACTION_APPLY,
                &params(&["RECORD_COUNT", "ENTITY_COUNT"]),
                3,
                &scheduler,
            )
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn retire_decrements() {
        let handler = DataMartHandler::new(pool().await);
        let scheduler = test_follow_up_scheduler().await;
        assert!(
            handler
                .handle_task(ACTION_APPLY, &params(&["RECORD_COUNT"]), 1, &scheduler)
                .await
        );
        assert!(
            handler
                .handle_task(ACTION_RETIRE, &params(&["RECORD_COUNT"]), 1, &scheduler)
                .await
        );
    }

    #[tokio::test]
    async fn unknown_action_fails_without_touching_the_database() {
        let handler = DataMartHandler::new(pool().await);
        let scheduler = test_follow_up_scheduler().await;
        let ok = handler
            .handle_task("BOGUS", &params(&["RECORD_COUNT"]), 1, &scheduler)
            .await;
        assert!(!ok);
    }

    async fn test_follow_up_scheduler() -> FollowUpScheduler {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = dmr_scheduler::SqliteFollowUpStore::new(pool);
        store.ensure_schema(false).await.unwrap();
        FollowUpScheduler::new(Arc::new(store))
    }
}
