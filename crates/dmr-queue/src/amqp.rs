//! AMQP 0.9.1 (RabbitMQ) [`MessageConsumer`] built on `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{error, warn};

use crate::{Error, MessageConsumer, MessageHandler, Result, ShutdownFlag};

/// Options recognized by `init` for the AMQP driver.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub virtual_host: String,
    pub queue: String,
}

impl AmqpConfig {
    fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.virtual_host.trim_start_matches('/')
        )
    }
}

pub struct AmqpConsumer {
    channel: Channel,
    config: AmqpConfig,
    shutdown: ShutdownFlag,
}

impl AmqpConsumer {
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(|err| Error::transport(format!("amqp connect: {err}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| Error::transport(format!("amqp create_channel: {err}")))?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| Error::transport(format!("amqp queue_declare: {err}")))?;

        channel
            .basic_qos(10, BasicQosOptions::default())
            .await
            .map_err(|err| Error::transport(format!("amqp basic_qos: {err}")))?;

        Ok(Self {
            channel,
            config,
            shutdown: ShutdownFlag::new(),
        })
    }
}

#[async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.config.queue,
                "dmr-replicator",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| Error::transport(format!("amqp basic_consume: {err}")))?;

        while !self.shutdown.is_raised() {
            let delivery = tokio::select! {
                delivery = consumer.next() => delivery,
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
            };

            let Some(delivery) = delivery else {
                warn!("amqp consumer stream ended");
                break;
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(%err, "amqp delivery error");
                    continue;
                }
            };

            let payload = serde_json::from_slice(&delivery.data)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&delivery.data).into_owned()));

            let success = handler.handle(payload).await;
            let ack_result = if success {
                delivery.ack(BasicAckOptions::default()).await
            } else {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            };

            if let Err(err) = ack_result {
                error!(%err, "amqp ack/nack failed");
            }
        }

        Ok(())
    }

    fn destroy(&self) {
        self.shutdown.raise();
    }
}
