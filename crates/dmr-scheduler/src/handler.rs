use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dmr_core::{ParamMap, Task};

use crate::error::Result;
use crate::followup::FollowUpStore;

/// External collaborator that turns dispatched tasks into domain effects
/// (e.g. data-mart SQL). Supplied by the embedding application.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Called once during scheduler `init`; may block startup until the
    /// handler's own dependencies (e.g. a database pool) are ready.
    async fn wait_until_ready(&self, timeout: Duration) -> bool;

    /// Invoked by a worker once resources are held and the task is
    /// `STARTED`. `multiplicity` is how many collapsed occurrences this
    /// delivery represents. Returns `true` on success.
    async fn handle_task(
        &self,
        action: &str,
        parameters: &ParamMap,
        multiplicity: u32,
        follow_ups: &FollowUpScheduler,
    ) -> bool;
}

/// Handed to a running handler so it can enqueue new follow-up tasks as a
/// side effect of processing the current one. Enqueued tasks are persisted
/// to the durable store before `handle_task` returns, so they survive even
/// if the handler subsequently fails.
#[derive(Clone)]
pub struct FollowUpScheduler {
    store: Arc<dyn FollowUpStore>,
}

impl FollowUpScheduler {
    pub fn new(store: Arc<dyn FollowUpStore>) -> Self {
        Self { store }
    }

    pub async fn schedule(&self, task: Task) -> Result<()> {
        self.store.enqueue_follow_up_task(&task).await
    }
}
