use std::time::Duration;

use clap::Parser;
use dmr_scheduler::SchedulerConfig;

/// CLI flags mirror the configuration surface one-to-one; every flag also
/// has an environment-variable fallback.
#[derive(Debug, Parser)]
#[command(name = "dmr-server", about = "Data-mart replicator task scheduler")]
pub struct Args {
    #[arg(long, env = "SQS_URL")]
    pub sqs_url: Option<String>,
    #[arg(long, env = "RABBIT_HOST")]
    pub rabbit_host: Option<String>,
    #[arg(long, env = "RABBIT_PORT", default_value_t = 5672)]
    pub rabbit_port: u16,
    #[arg(long, env = "RABBIT_USER")]
    pub rabbit_user: Option<String>,
    #[arg(long, env = "RABBIT_PASSWORD")]
    pub rabbit_password: Option<String>,
    #[arg(long, env = "RABBIT_VIRTUAL_HOST", default_value = "/")]
    pub rabbit_virtual_host: String,
    #[arg(long, env = "RABBIT_QUEUE")]
    pub rabbit_queue: Option<String>,
    #[arg(long, env = "DATABASE_INFO_QUEUE")]
    pub database_info_queue: bool,

    #[arg(long, env = "SQLITE_DATABASE_FILE")]
    pub sqlite_database_file: Option<String>,
    #[arg(long, env = "POSTGRESQL_HOST")]
    pub postgresql_host: Option<String>,
    #[arg(long, env = "POSTGRESQL_PORT", default_value_t = 5432)]
    pub postgresql_port: u16,
    #[arg(long, env = "POSTGRESQL_DATABASE")]
    pub postgresql_database: Option<String>,
    #[arg(long, env = "POSTGRESQL_USER")]
    pub postgresql_user: Option<String>,
    #[arg(long, env = "POSTGRESQL_PASSWORD")]
    pub postgresql_password: Option<String>,

    /// Opaque Senzing engine init settings, passed through unexamined.
    #[arg(long, env = "SENZING_INI_FILE")]
    pub ini_file: Option<String>,
    #[arg(long, env = "SENZING_INIT_FILE")]
    pub init_file: Option<String>,
    #[arg(long, env = "SENZING_INIT_JSON")]
    pub init_json: Option<String>,
    #[arg(long, env = "SENZING_MODULE_NAME", default_value = "dmr-server")]
    pub module_name: String,
    #[arg(long, env = "SENZING_VERBOSE")]
    pub verbose: bool,

    #[arg(long, env = "CONCURRENCY", default_value_t = 8)]
    pub concurrency: usize,
    #[arg(long, env = "STANDARD_TIMEOUT_MS", default_value_t = 3000)]
    pub standard_timeout_ms: u64,
    #[arg(long, env = "POSTPONED_TIMEOUT_MS", default_value_t = 1000)]
    pub postponed_timeout_ms: u64,
    #[arg(long, env = "FOLLOW_UP_DELAY_MS", default_value_t = 200)]
    pub follow_up_delay_ms: u64,
    #[arg(long, env = "FOLLOW_UP_TIMEOUT_MS", default_value_t = 30_000)]
    pub follow_up_timeout_ms: u64,
    #[arg(long, env = "FOLLOW_UP_FETCH", default_value_t = 10)]
    pub follow_up_fetch: i64,
}

#[derive(Debug, Clone)]
pub enum QueueSelection {
    Sqs { url: String },
    Rabbit {
        host: String,
        port: u16,
        user: String,
        password: String,
        virtual_host: String,
        queue: String,
    },
    DatabaseInfoQueue,
}

#[derive(Debug, Clone)]
pub enum DatabaseSelection {
    Sqlite { file: String },
    Postgresql {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

/// Passed through unexamined to whatever Senzing client the embedding
/// deployment wires in; the core never inspects these fields.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SenzingEngineConfig {
    pub ini_file: Option<String>,
    pub init_file: Option<String>,
    pub init_json: Option<String>,
    pub module_name: String,
    pub verbose: bool,
}

pub struct ReplicatorConfig {
    pub queue: QueueSelection,
    pub database: DatabaseSelection,
    pub senzing: SenzingEngineConfig,
    pub scheduler: SchedulerConfig,
}

impl Args {
    pub fn resolve(self) -> anyhow::Result<ReplicatorConfig> {
        let queue = self.resolve_queue()?;
        let database = self.resolve_database()?;

        let scheduler = SchedulerConfig {
            concurrency: self.concurrency,
            standard_timeout: Duration::from_millis(self.standard_timeout_ms),
            postponed_timeout: Duration::from_millis(self.postponed_timeout_ms),
            follow_up_delay: Duration::from_millis(self.follow_up_delay_ms),
            follow_up_timeout: Duration::from_millis(self.follow_up_timeout_ms),
            follow_up_fetch: self.follow_up_fetch,
        };
        scheduler
            .validate()
            .map_err(|err| anyhow::anyhow!("invalid scheduler configuration: {err}"))?;

        let senzing = SenzingEngineConfig {
            ini_file: self.ini_file,
            init_file: self.init_file,
            init_json: self.init_json,
            module_name: self.module_name,
            verbose: self.verbose,
        };

        Ok(ReplicatorConfig {
            queue,
            database,
            senzing,
            scheduler,
        })
    }

    fn resolve_queue(&self) -> anyhow::Result<QueueSelection> {
        let mut selected = Vec::new();
        if self.sqs_url.is_some() {
            selected.push("sqsUrl");
        }
        if self.rabbit_host.is_some() || self.rabbit_queue.is_some() {
            selected.push("rabbit*");
        }
        if self.database_info_queue {
            selected.push("databaseInfoQueue");
        }

        match selected.len() {
            0 => anyhow::bail!("no queue selected: set sqsUrl, rabbit*, or databaseInfoQueue"),
            1 => {}
            _ => anyhow::bail!("more than one queue selected: {}", selected.join(", ")),
        }

        if let Some(url) = &self.sqs_url {
            return Ok(QueueSelection::Sqs { url: url.clone() });
        }
        if self.database_info_queue {
            return Ok(QueueSelection::DatabaseInfoQueue);
        }

        let host = self
            .rabbit_host
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rabbitQueue set without rabbitHost"))?;
        let queue = self
            .rabbit_queue
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rabbitHost set without rabbitQueue"))?;
        Ok(QueueSelection::Rabbit {
            host,
            port: self.rabbit_port,
            user: self.rabbit_user.clone().unwrap_or_default(),
            password: self.rabbit_password.clone().unwrap_or_default(),
            virtual_host: self.rabbit_virtual_host.clone(),
            queue,
        })
    }

    fn resolve_database(&self) -> anyhow::Result<DatabaseSelection> {
        let sqlite = self.sqlite_database_file.is_some();
        let postgres = self.postgresql_host.is_some() || self.postgresql_database.is_some();

        match (sqlite, postgres) {
            (true, true) => anyhow::bail!("both sqliteDatabaseFile and postgresql* were set"),
            (false, false) => anyhow::bail!("no data-mart database selected"),
            (true, false) => Ok(DatabaseSelection::Sqlite {
                file: self.sqlite_database_file.clone().unwrap(),
            }),
            (false, true) => Ok(DatabaseSelection::Postgresql {
                host: self
                    .postgresql_host
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("postgresqlDatabase set without postgresqlHost"))?,
                port: self.postgresql_port,
                database: self
                    .postgresql_database
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("postgresqlHost set without postgresqlDatabase"))?,
                user: self.postgresql_user.clone().unwrap_or_default(),
                password: self.postgresql_password.clone().unwrap_or_default(),
            }),
        }
    }
}
