//! Translates one upstream INFO message into a group of resource-locked
//! data-mart tasks and commits them to the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use dmr_core::{ListBuilder, ParamsBuilder, ResourceKey, Task, TaskGroup};
use dmr_queue::MessageHandler;
use dmr_scheduler::SchedulingService;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::datamart::Statistic;
use crate::handler::{ACTION_APPLY, ACTION_RETIRE};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoMessage {
    data_source: String,
    #[serde(default)]
    record_id: String,
    #[serde(default)]
    affected_entities: Vec<AffectedEntity>,
    #[serde(default)]
    notification: Notification,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AffectedEntity {
    entity_id: i64,
    #[serde(default)]
    data_source_2: String,
    #[serde(default)]
    match_key: String,
    #[serde(default)]
    principle: String,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum Notification {
    #[default]
    AffectedEntity,
    UnaffectedEntity,
    Deleted,
}

/// Consumes INFO messages and turns each into one [`TaskGroup`] of
/// per-entity `APPLY`/`RETIRE` tasks, committed as a unit so a fast-fail
/// group aborts siblings that share a malformed message.
pub struct IngestHandler {
    scheduler: Arc<SchedulingService>,
}

impl IngestHandler {
    pub fn new(scheduler: Arc<SchedulingService>) -> Self {
        Self { scheduler }
    }

    fn build_tasks(message: &InfoMessage, group: dmr_core::TaskGroupId) -> Vec<Task> {
        let (action, statistics): (&str, &[Statistic]) = match message.notification {
            Notification::AffectedEntity => (
                ACTION_APPLY,
                &[Statistic::RecordCount, Statistic::EntityCount],
            ),
            Notification::Deleted => (ACTION_RETIRE, &[Statistic::RecordCount]),
            Notification::UnaffectedEntity => return Vec::new(),
        };

        message
            .affected_entities
            .iter()
            .map(|entity| {
                let statistics_list = statistics
                    .iter()
                    .fold(ListBuilder::new(), |list, stat| {
                        list.push(stat.as_column_value())
                    })
                    .build();

                let parameters = ParamsBuilder::new()
                    .set("dataSource1", message.data_source.clone())
                    .unwrap()
                    .set("dataSource2", entity.data_source_2.clone())
                    .unwrap()
                    .set("matchKey", entity.match_key.clone())
                    .unwrap()
                    .set("principle", entity.principle.clone())
                    .unwrap()
                    .set("statistics", statistics_list)
                    .unwrap()
                    .set("recordId", message.record_id.clone())
                    .unwrap()
                    .build();

                Task::builder(action)
                    .parameters(parameters)
                    .resource_key(ResourceKey::single("ENTITY", entity.entity_id.to_string()))
                    .allow_collapse(true)
                    .task_group(group)
                    .build()
            })
            .collect()
    }
}

#[async_trait]
impl MessageHandler for IngestHandler {
    async fn handle(&self, payload: Value) -> bool {
        let message: InfoMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "malformed INFO message, dropping");
                return false;
            }
        };

        let group = Arc::new(TaskGroup::new(false));
        let tasks = Self::build_tasks(&message, group.id());
        if tasks.is_empty() {
            return true;
        }

        match self.scheduler.commit_and_await(&group, tasks).await {
            Ok(state) => state.is_terminal() && state != dmr_core::GroupState::Failed,
            Err(err) => {
                warn!(error = %err, "failed to commit task group");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affected_entity_message_produces_one_apply_task_per_entity() {
        let message: InfoMessage = serde_json::from_value(serde_json::json!({
            "dataSource": "CUSTOMERS",
            "recordId": "REC-1",
            "affectedEntities": [
                {"entityId": 100},
                {"entityId": 101},
            ],
        }))
        .unwrap();

        let tasks = IngestHandler::build_tasks(&message, dmr_core::TaskGroupId::new());
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.action() == ACTION_APPLY));
        assert!(tasks.iter().all(|t| t.allow_collapse()));
    }

    #[test]
    fn deleted_notification_produces_retire_tasks() {
        let message: InfoMessage = serde_json::from_value(serde_json::json!({
            "dataSource": "CUSTOMERS",
            "notification": "DELETED",
            "affectedEntities": [{"entityId": 7}],
        }))
        .unwrap();

        let tasks = IngestHandler::build_tasks(&message, dmr_core::TaskGroupId::new());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].action(), ACTION_RETIRE);
    }

    #[test]
    fn unaffected_entity_notification_produces_no_tasks() {
        let message: InfoMessage = serde_json::from_value(serde_json::json!({
            "dataSource": "CUSTOMERS",
            "notification": "UNAFFECTED_ENTITY",
            "affectedEntities": [{"entityId": 7}],
        }))
        .unwrap();

        assert!(IngestHandler::build_tasks(&message, dmr_core::TaskGroupId::new()).is_empty());
    }

    #[test]
    fn malformed_payload_is_rejected_before_building_tasks() {
        let result: Result<InfoMessage, _> = serde_json::from_value(serde_json::json!({
            "recordId": "REC-1",
        }));
        assert!(result.is_err());
    }
}
