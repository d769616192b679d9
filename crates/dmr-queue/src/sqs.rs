//! SQS-backed [`MessageConsumer`]: receipt-handle ack tokens,
//! visibility-timeout-based nack/requeue, and `ApproximateReceiveCount`
//! surfaced as delivery count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use tracing::{error, info};

use crate::{retry_with_backoff, Error, MessageConsumer, MessageHandler, QueueMessage, Result, ShutdownFlag};

/// Options recognized by `init` for the SQS driver.
#[derive(Debug, Clone)]
pub struct SqsConfig {
    pub url: String,
    pub max_retries: u32,
    pub retry_wait: Duration,
    pub visibility_timeout: Option<Duration>,
}

impl SqsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_retries: 10,
            retry_wait: Duration::from_millis(5000),
            visibility_timeout: None,
        }
    }
}

pub struct SqsConsumer {
    client: aws_sdk_sqs::Client,
    config: SqsConfig,
    shutdown: ShutdownFlag,
}

impl SqsConsumer {
    pub fn new(client: aws_sdk_sqs::Client, config: SqsConfig) -> Self {
        Self {
            client,
            config,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub async fn from_env(config: SqsConfig) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self::new(aws_sdk_sqs::Client::new(&aws_config), config))
    }

    async fn receive_batch(&self) -> Result<Vec<QueueMessage>> {
        let visibility_timeout_secs: i32 = self
            .config
            .visibility_timeout
            .map(|d| d.as_secs().min(43_200) as i32)
            .unwrap_or(30);

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.config.url)
            .max_number_of_messages(10)
            .visibility_timeout(visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|err| Error::transport(format!("sqs ReceiveMessage: {err}")))?;

        let mut out = Vec::new();
        for message in resp.messages() {
            let Some(ack_token) = message.receipt_handle() else {
                continue;
            };
            let message_id = message.message_id().unwrap_or_default().to_string();
            let deliveries = message
                .attributes()
                .and_then(|m| m.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse::<i32>().ok())
                .unwrap_or(1);
            let body = message.body().unwrap_or_default();
            let payload = serde_json::from_str(body)
                .unwrap_or_else(|_| serde_json::Value::String(body.to_string()));

            out.push(QueueMessage {
                message_id,
                ack_token: ack_token.to_string(),
                payload,
                deliveries,
            });
        }

        Ok(out)
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.config.url)
            .receipt_handle(ack_token)
            .send()
            .await
            .map_err(|err| Error::transport(format!("sqs DeleteMessage: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer for SqsConsumer {
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        while !self.shutdown.is_raised() {
            let messages = retry_with_backoff(self.config.max_retries, self.config.retry_wait, || {
                self.receive_batch()
            })
            .await
            .map_err(|err| {
                error!(%err, "sqs consumer exhausted retries, aborting");
                Error::RetriesExhausted {
                    attempts: self.config.max_retries,
                    message: err.to_string(),
                }
            })?;

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
                        error!(%err, message_id = %message.message_id, "failed to ack sqs message");
                    }
                } else {
                    info!(message_id = %message.message_id, "handler failed, leaving message for sqs redelivery");
                }
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
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::retry_with_backoff;

    /// `consume()` retries `receive_batch` through this exact helper with
    /// `config.max_retries`/`config.retry_wait`; exercising it directly with
    /// an always-failing operation proves the give-up path the SQS driver
    /// relies on when a batch receive keeps failing.
    #[tokio::test]
    async fn retry_gives_up_once_max_retries_is_exhausted() {
        let attempts = AtomicU32::new(0);
        let max_retries = 2;

        let result: std::result::Result<(), String> = retry_with_backoff(max_retries, Duration::from_millis(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("sqs receive failed".to_string()) }
        })
        .await;

        assert!(result.is_err(), "the consumer must abort once retries are exhausted");
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            max_retries + 1,
            "the first attempt plus max_retries retries, then give up"
        );
    }

    #[tokio::test]
    async fn retry_succeeds_as_soon_as_the_operation_recovers() {
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<&'static str, String> =
            retry_with_backoff(5, Duration::from_millis(1), || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("batch received")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("batch received"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn default_config_matches_the_documented_retry_policy() {
        let config = SqsConfig::new("https://example/queue");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.retry_wait, Duration::from_millis(5000));
        assert!(config.visibility_timeout.is_none());
    }
}
