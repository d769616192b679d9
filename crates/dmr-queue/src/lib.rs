//! Pluggable consumer drivers over the upstream INFO-message queue.
//!
//! A [`MessageConsumer`] pulls opaque JSON payloads from one of three
//! backends (SQS, AMQP, or a SQL-backed queue table) and hands each to a
//! [`MessageHandler`], acknowledging only on success. `destroy()` is
//! idempotent and the running `consume()` loop exits cooperatively rather
//! than by propagating an error.

mod error;
pub mod amqp;
pub mod sql;
pub mod sqs;

pub use error::{Error, Result};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

/// One message pulled from the queue, opaque to everything but the driver
/// that produced it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub ack_token: String,
    pub payload: Value,
    pub deliveries: i32,
}

/// Handles one queue message and reports whether it was processed
/// successfully. A `false` return (or the handler panicking, for in-process
/// drivers) leaves the message unacknowledged so the driver's redelivery
/// policy kicks in.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> bool;
}

/// Contract implemented by each queue driver.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Enter a loop fetching batches and delivering them to `handler` until
    /// `destroy()` is called. Returns `Ok(())` on cooperative exit, `Err` if
    /// the driver's redelivery/retry policy is exhausted.
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Idempotent. Signals the running `consume()` loop to exit after its
    /// current iteration.
    fn destroy(&self);
}

/// Shared shutdown signal used by every driver's `consume()` loop: an
/// atomic flag paired with a `Notify` so `destroy()` wakes a sleeping loop
/// immediately instead of waiting out its poll interval.
#[derive(Clone)]
pub(crate) struct ShutdownFlag(Arc<Shared>);

struct Shared {
    raised: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Shared {
            raised: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub(crate) fn raise(&self) {
        self.0.raised.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early if `raise()` is called.
    pub(crate) async fn sleep_or_raised(&self, duration: Duration) {
        if self.is_raised() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.0.notify.notified() => {}
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.raised.load(Ordering::Acquire) {
            warn!("queue consumer dropped without destroy() being called");
        }
    }
}

/// Retry an async operation with a fixed delay between attempts. Gives up
/// after `max_retries` additional attempts beyond the first.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    max_retries: u32,
    wait: Duration,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries => {
                attempt += 1;
                warn!(attempt, %err, "queue operation failed, retrying");
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}
