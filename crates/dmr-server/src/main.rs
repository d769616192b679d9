mod config;
mod datamart;
mod handler;
mod ingest;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dmr_queue::amqp::{AmqpConfig, AmqpConsumer};
use dmr_queue::sql::{SqlConfig, SqlConsumer, SqlPool as QueueSqlPool};
use dmr_queue::sqs::{SqsConfig, SqsConsumer};
use dmr_queue::MessageConsumer;
use dmr_scheduler::{SchedulingService, SqliteFollowUpStore, PostgresFollowUpStore, FollowUpStore};
use sqlx::{PgPool, SqlitePool};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use config::{Args, DatabaseSelection, QueueSelection};
use datamart::DataMartPool;
use handler::DataMartHandler;
use ingest::IngestHandler;

static DATA_MART_SQLITE_MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/sqlite");
static DATA_MART_POSTGRES_MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/postgres");
static FOLLOW_UP_SQLITE_MIGRATOR: sqlx::migrate::Migrator =
    sqlx::migrate!("../dmr-scheduler/migrations/sqlite");
static FOLLOW_UP_POSTGRES_MIGRATOR: sqlx::migrate::Migrator =
    sqlx::migrate!("../dmr-scheduler/migrations/postgres");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
        )
        .init();

    let config = Args::parse().resolve()?;

    let (data_mart_pool, follow_up_store): (DataMartPool, Arc<dyn FollowUpStore>) =
        match &config.database {
            DatabaseSelection::Sqlite { file } => {
                let pool = SqlitePool::connect(&format!("sqlite://{file}?mode=rwc"))
                    .await
                    .context("failed to connect to the sqlite data-mart database")?;
                DATA_MART_SQLITE_MIGRATOR
                    .run(&pool)
                    .await
                    .context("failed to run data-mart migrations")?;
                FOLLOW_UP_SQLITE_MIGRATOR
                    .run(&pool)
                    .await
                    .context("failed to run follow-up-queue migrations")?;
                let store = Arc::new(SqliteFollowUpStore::new(pool.clone()));
                (DataMartPool::Sqlite(pool), store)
            }
            DatabaseSelection::Postgresql {
                host,
                port,
                database,
                user,
                password,
            } => {
                let url = format!("postgres://{user}:{password}@{host}:{port}/{database}");
                let pool = PgPool::connect(&url)
                    .await
                    .context("failed to connect to the postgresql data-mart database")?;
                DATA_MART_POSTGRES_MIGRATOR
                    .run(&pool)
                    .await
                    .context("failed to run data-mart migrations")?;
                FOLLOW_UP_POSTGRES_MIGRATOR
                    .run(&pool)
                    .await
                    .context("failed to run follow-up-queue migrations")?;
                let store = Arc::new(PostgresFollowUpStore::new(pool.clone()));
                (DataMartPool::Postgres(pool), store)
            }
        };

    let task_handler = Arc::new(DataMartHandler::new(data_mart_pool));
    let scheduler = SchedulingService::new(config.scheduler.clone(), task_handler, follow_up_store);
    scheduler
        .init(Duration::from_secs(30))
        .await
        .context("scheduler failed to initialize")?;

    let ingest_handler: Arc<dyn dmr_queue::MessageHandler> =
        Arc::new(IngestHandler::new(scheduler.clone()));

    let consumer: Arc<dyn MessageConsumer> = match &config.queue {
        QueueSelection::Sqs { url } => Arc::new(
            SqsConsumer::from_env(SqsConfig::new(url.clone()))
                .await
                .context("failed to set up the sqs consumer")?,
        ),
        QueueSelection::Rabbit {
            host,
            port,
            user,
            password,
            virtual_host,
            queue,
        } => Arc::new(
            AmqpConsumer::connect(AmqpConfig {
                host: host.clone(),
                port: *port,
                user: user.clone(),
                password: password.clone(),
                virtual_host: virtual_host.clone(),
                queue: queue.clone(),
            })
            .await
            .context("failed to connect to rabbitmq")?,
        ),
        QueueSelection::DatabaseInfoQueue => {
            let pool = match &config.database {
                DatabaseSelection::Sqlite { file } => {
                    QueueSqlPool::Sqlite(SqlitePool::connect(&format!("sqlite://{file}?mode=rwc")).await?)
                }
                DatabaseSelection::Postgresql {
                    host,
                    port,
                    database,
                    user,
                    password,
                } => QueueSqlPool::Postgres(
                    PgPool::connect(&format!(
                        "postgres://{user}:{password}@{host}:{port}/{database}"
                    ))
                    .await?,
                ),
            };
            let consumer = SqlConsumer::new(SqlConfig::new(pool));
            consumer
                .ensure_schema()
                .await
                .context("failed to ensure the sql queue schema exists")?;
            Arc::new(consumer)
        }
    };

    let signal = {
        let consumer = consumer.clone();
        let scheduler = scheduler.clone();
        tokio::task::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigint = signal(SignalKind::interrupt())?;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigusr1 = signal(SignalKind::user_defined1())?;

                loop {
                    tokio::select! {
                        _ = sigint.recv() => break,
                        _ = sigterm.recv() => break,
                        _ = sigusr1.recv() => {
                            if let Err(err) = scheduler.dump_follow_up_table().await {
                                tracing::error!(%err, "failed to dump follow-up table");
                            }
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            tokio::signal::ctrl_c().await?;

            tracing::info!("received shutdown signal");
            consumer.destroy();
            scheduler.destroy(Duration::from_secs(30)).await;

            anyhow::Ok(())
        })
    };

    tracing::info!("dmr-server starting up");
    consumer
        .consume(ingest_handler)
        .await
        .context("queue consumer exited with an error")?;

    signal
        .await
        .context("signal task exited early with an error")??;

    Ok(())
}
