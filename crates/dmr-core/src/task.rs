use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::params::{ParamMap, ParamsBuilder};
use crate::resource::ResourceKey;
use crate::signature;

/// Identifies a single [`Task`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the [`TaskGroup`](crate::group::TaskGroup) a task was submitted
/// with. A task has no `TaskGroupId` iff it is a follow-up task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct TaskGroupId(pub Uuid);

impl TaskGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle of a single task, as tracked by the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Unscheduled,
    Scheduled,
    Started,
    Successful,
    Failed,
    Aborted,
}

impl TaskState {
    /// Whether this is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Successful | TaskState::Failed | TaskState::Aborted
        )
    }

    /// Validate (and perform, if valid) a state transition:
    /// `UNSCHEDULED -> SCHEDULED -> STARTED -> (SUCCESSFUL | FAILED | ABORTED)`.
    ///
    /// `ABORTED` is additionally reachable directly from `UNSCHEDULED`, which
    /// is how fast-fail aborts tasks that were never dispatched.
    pub fn transition(self, to: TaskState) -> Result<TaskState> {
        let allowed = matches!(
            (self, to),
            (TaskState::Unscheduled, TaskState::Scheduled)
                | (TaskState::Unscheduled, TaskState::Aborted)
                | (TaskState::Scheduled, TaskState::Started)
                | (TaskState::Scheduled, TaskState::Aborted)
                | (TaskState::Started, TaskState::Successful)
                | (TaskState::Started, TaskState::Failed)
        );

        if allowed {
            Ok(to)
        } else {
            Err(Error::IllegalTransition {
                from: format!("{self:?}"),
                to: format!("{to:?}"),
            })
        }
    }
}

/// A unit of work: an `action` name, its parameters, the resources it needs
/// to hold exclusively while running, and whether it may collapse with
/// identical sibling tasks. Immutable after construction.
#[derive(Clone, Debug)]
pub struct Task {
    id: TaskId,
    action: String,
    parameters: ParamMap,
    resource_keys: Vec<ResourceKey>,
    task_group: Option<TaskGroupId>,
    allow_collapse: bool,
    signature: String,
}

impl Task {
    pub fn builder(action: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(action)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn parameters(&self) -> &ParamMap {
        &self.parameters
    }

    pub fn resource_keys(&self) -> &[ResourceKey] {
        &self.resource_keys
    }

    pub fn task_group(&self) -> Option<TaskGroupId> {
        self.task_group
    }

    /// A task without a [`TaskGroupId`] is a follow-up task.
    pub fn is_follow_up(&self) -> bool {
        self.task_group.is_none()
    }

    pub fn allow_collapse(&self) -> bool {
        self.allow_collapse
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// Builds a [`Task`]. Construct parameters with [`ParamsBuilder`] first.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    action: String,
    parameters: ParamMap,
    resource_keys: Vec<ResourceKey>,
    task_group: Option<TaskGroupId>,
    allow_collapse: bool,
}

impl TaskBuilder {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: ParamMap::new(),
            resource_keys: Vec::new(),
            task_group: None,
            allow_collapse: false,
        }
    }

    pub fn parameters(mut self, parameters: ParamMap) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameters_builder(mut self, builder: ParamsBuilder) -> Self {
        self.parameters = builder.build();
        self
    }

    pub fn resource_key(mut self, key: ResourceKey) -> Self {
        if !self.resource_keys.contains(&key) {
            self.resource_keys.push(key);
        }
        self
    }

    pub fn resource_keys(mut self, keys: impl IntoIterator<Item = ResourceKey>) -> Self {
        for key in keys {
            self = self.resource_key(key);
        }
        self
    }

    pub fn task_group(mut self, group: TaskGroupId) -> Self {
        self.task_group = Some(group);
        self
    }

    pub fn allow_collapse(mut self, allow: bool) -> Self {
        self.allow_collapse = allow;
        self
    }

    pub fn build(self) -> Task {
        let signature = signature::signature(&self.action, &self.parameters, &self.resource_keys);

        Task {
            id: TaskId::new(),
            action: self.action,
            parameters: self.parameters,
            resource_keys: self.resource_keys,
            task_group: self.task_group,
            allow_collapse: self.allow_collapse,
            signature,
        }
    }
}
