//! The data mart itself: a `data_source pair x match key x principle x
//! statistic -> count` table, kept current by [`crate::handler::DataMartHandler`]
//! and read back through [`ReportService`]'s paginated queries.

use sqlx::{PgPool, Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Statistic {
    RecordCount,
    EntityCount,
    MatchCount,
    AmbiguousMatchCount,
    PossibleMatchCount,
    PossibleRelationCount,
    DisclosedRelationCount,
}

impl Statistic {
    pub fn as_column_value(self) -> &'static str {
        match self {
            Statistic::RecordCount => "RECORD_COUNT",
            Statistic::EntityCount => "ENTITY_COUNT",
            Statistic::MatchCount => "MATCH_COUNT",
            Statistic::AmbiguousMatchCount => "AMBIGUOUS_MATCH_COUNT",
            Statistic::PossibleMatchCount => "POSSIBLE_MATCH_COUNT",
            Statistic::PossibleRelationCount => "POSSIBLE_RELATION_COUNT",
            Statistic::DisclosedRelationCount => "DISCLOSED_RELATION_COUNT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "RECORD_COUNT" => Statistic::RecordCount,
            "ENTITY_COUNT" => Statistic::EntityCount,
            "MATCH_COUNT" => Statistic::MatchCount,
            "AMBIGUOUS_MATCH_COUNT" => Statistic::AmbiguousMatchCount,
            "POSSIBLE_MATCH_COUNT" => Statistic::PossibleMatchCount,
            "POSSIBLE_RELATION_COUNT" => Statistic::PossibleRelationCount,
            "DISCLOSED_RELATION_COUNT" => Statistic::DisclosedRelationCount,
            _ => return None,
        })
    }
}

/// A single `data_mart_stats` row's identity, excluding its count.
#[derive(Debug, Clone)]
pub struct StatKey {
    pub data_source_1: String,
    pub data_source_2: String,
    pub match_key: String,
    pub principle: String,
    pub statistic: Statistic,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatRow {
    pub data_source_1: String,
    pub data_source_2: String,
    pub match_key: String,
    pub principle: String,
    pub statistic: String,
    pub count: i64,
}

#[derive(Clone)]
pub enum DataMartPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl DataMartPool {
    pub async fn ping(&self) -> bool {
        match self {
            DataMartPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
            DataMartPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        }
    }

    /// Increment (or decrement, for a negative `delta`) one statistic cell,
    /// creating the row on first touch.
    pub async fn apply_delta(&self, key: &StatKey, delta: i64) -> sqlx::Result<()> {
        match self {
            DataMartPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO data_mart_stats (data_source_1, data_source_2, match_key, principle, statistic, count)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT (data_source_1, data_source_2, match_key, principle, statistic)
                     DO UPDATE SET count = count + excluded.count",
                )
                .bind(&key.data_source_1)
                .bind(&key.data_source_2)
                .bind(&key.match_key)
                .bind(&key.principle)
                .bind(key.statistic.as_column_value())
                .bind(delta)
                .execute(pool)
                .await?;
            }
            DataMartPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO data_mart_stats (data_source_1, data_source_2, match_key, principle, statistic, count)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (data_source_1, data_source_2, match_key, principle, statistic)
                     DO UPDATE SET count = data_mart_stats.count + excluded.count",
                )
                .bind(&key.data_source_1)
                .bind(&key.data_source_2)
                .bind(&key.match_key)
                .bind(&key.principle)
                .bind(key.statistic.as_column_value())
                .bind(delta)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }
}

/// Paginated reads over the aggregated statistics, filterable by data
/// source.
pub struct ReportService {
    pool: DataMartPool,
}

pub struct Page {
    pub rows: Vec<StatRow>,
    pub total: i64,
}

impl ReportService {
    pub fn new(pool: DataMartPool) -> Self {
        Self { pool }
    }

    pub async fn page(
        &self,
        data_source: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> sqlx::Result<Page> {
        let limit = limit.clamp(1, 500);
        let offset = offset.max(0);

        match &self.pool {
            DataMartPool::Sqlite(pool) => {
                let (where_clause, bind_source) = match data_source {
                    Some(_) => (" WHERE data_source_1 = ?", true),
                    None => ("", false),
                };
                let total_sql = format!("SELECT COUNT(*) AS n FROM data_mart_stats{where_clause}");
                let mut total_query = sqlx::query(&total_sql);
                if bind_source {
                    total_query = total_query.bind(data_source.unwrap());
                }
                let total: i64 = total_query.fetch_one(pool).await?.try_get("n")?;

                let select_sql = format!(
                    "SELECT data_source_1, data_source_2, match_key, principle, statistic, count
                     FROM data_mart_stats{where_clause}
                     ORDER BY id
                     LIMIT ? OFFSET ?"
                );
                let mut select_query = sqlx::query(&select_sql);
                if bind_source {
                    select_query = select_query.bind(data_source.unwrap());
                }
                let rows = select_query
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| StatRow {
                        data_source_1: row.get("data_source_1"),
                        data_source_2: row.get("data_source_2"),
                        match_key: row.get("match_key"),
                        principle: row.get("principle"),
                        statistic: row.get("statistic"),
                        count: row.get("count"),
                    })
                    .collect();

                Ok(Page { rows, total })
            }
            DataMartPool::Postgres(pool) => {
                let (where_clause, bind_source) = match data_source {
                    Some(_) => (" WHERE data_source_1 = $1", true),
                    None => ("", false),
                };
                let total_sql = format!("SELECT COUNT(*) AS n FROM data_mart_stats{where_clause}");
                let mut total_query = sqlx::query(&total_sql);
                if bind_source {
                    total_query = total_query.bind(data_source.unwrap());
                }
                let total: i64 = total_query.fetch_one(pool).await?.try_get("n")?;

                let select_sql = if bind_source {
                    "SELECT data_source_1, data_source_2, match_key, principle, statistic, count
                     FROM data_mart_stats WHERE data_source_1 = $1
                     ORDER BY id LIMIT $2 OFFSET $3"
                } else {
                    "SELECT data_source_1, data_source_2, match_key, principle, statistic, count
                     FROM data_mart_stats
                     ORDER BY id LIMIT $1 OFFSET $2"
                };

                let mut select_query = sqlx::query(select_sql);
                if bind_source {
                    select_query = select_query.bind(data_source.unwrap());
                }
                let rows = select_query
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| StatRow {
                        data_source_1: row.get("data_source_1"),
                        data_source_2: row.get("data_source_2"),
                        match_key: row.get("match_key"),
                        principle: row.get("principle"),
                        statistic: row.get("statistic"),
                        count: row.get("count"),
                    })
                    .collect();

                Ok(Page { rows, total })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn key() -> StatKey {
        StatKey {
            data_source_1: "CUSTOMERS".into(),
            data_source_2: String::new(),
            match_key: String::new(),
            principle: String::new(),
            statistic: Statistic::RecordCount,
        }
    }

    #[tokio::test]
    async fn repeated_deltas_accumulate_into_one_row() {
        let pool = pool().await;
        pool.apply_delta(&key(), 1).await.unwrap();
        pool.apply_delta(&key(), 1).await.unwrap();
        pool.apply_delta(&key(), -1).await.unwrap();

        let report = ReportService::new(pool);
        let page = report.page(None, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].count, 1);
    }

    #[tokio::test]
    async fn page_filters_by_data_source() {
        let pool = pool().await;
        pool.apply_delta(&key(), 1).await.unwrap();
        pool.apply_delta(
            &StatKey {
                data_source_1: "WATCHLIST".into(),
                ..key()
            },
            1,
        )
        .await
        .unwrap();

        let report = ReportService::new(pool);
        let page = report.page(Some("WATCHLIST"), 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].data_source_1, "WATCHLIST");
    }
}
