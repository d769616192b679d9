//! [`ScheduledTask`]: the scheduler-internal view of a task that is ready (or
//! waiting) to run.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::task::{Task, TaskState};

/// Wraps a [`Task`] with the bookkeeping the scheduler needs: how many
/// collapsed occurrences it represents, (for follow-up tasks) the durable
/// row backing it, and its live `UNSCHEDULED -> ... -> <terminal>` state.
#[derive(Debug)]
pub struct ScheduledTask {
    task: Task,
    multiplicity: u32,
    follow_up_id: Option<i64>,
    lease_expiration: Option<DateTime<Utc>>,
    state: Mutex<TaskState>,
}

impl ScheduledTask {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            multiplicity: 1,
            follow_up_id: None,
            lease_expiration: None,
            state: Mutex::new(TaskState::Unscheduled),
        }
    }

    pub fn with_follow_up(
        task: Task,
        multiplicity: u32,
        follow_up_id: i64,
        lease_expiration: DateTime<Utc>,
    ) -> Self {
        Self {
            task,
            multiplicity: multiplicity.max(1),
            follow_up_id: Some(follow_up_id),
            lease_expiration: Some(lease_expiration),
            state: Mutex::new(TaskState::Unscheduled),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Validate and perform a transition of the live task state, rejecting
    /// the call if it is not legal from the current state.
    pub fn transition(&self, to: TaskState) -> Result<TaskState> {
        let mut state = self.state.lock();
        *state = state.transition(to)?;
        Ok(*state)
    }

    pub fn mark_scheduled(&self) -> Result<()> {
        self.transition(TaskState::Scheduled).map(|_| ())
    }

    pub fn mark_started(&self) -> Result<()> {
        self.transition(TaskState::Started).map(|_| ())
    }

    pub fn mark_successful(&self) -> Result<()> {
        self.transition(TaskState::Successful).map(|_| ())
    }

    pub fn mark_failed(&self) -> Result<()> {
        self.transition(TaskState::Failed).map(|_| ())
    }

    pub fn mark_aborted(&self) -> Result<()> {
        self.transition(TaskState::Aborted).map(|_| ())
    }

    pub fn multiplicity(&self) -> u32 {
        self.multiplicity
    }

    pub fn follow_up_id(&self) -> Option<i64> {
        self.follow_up_id
    }

    pub fn lease_expiration(&self) -> Option<DateTime<Utc>> {
        self.lease_expiration
    }

    pub fn set_lease_expiration(&mut self, expiration: DateTime<Utc>) {
        self.lease_expiration = Some(expiration);
    }

    /// Merge `other` into this scheduled task, incrementing its multiplicity.
    ///
    /// Only legal when both tasks share a signature and both opted into
    /// collapsing.
    pub fn collapse_with(&mut self, other: &Task) -> Result<()> {
        if self.task.signature() != other.signature() {
            return Err(Error::invalid_argument(
                "cannot collapse tasks with different signatures",
            ));
        }
        if !self.task.allow_collapse() || !other.allow_collapse() {
            return Err(Error::invalid_argument(
                "cannot collapse tasks unless both allow collapsing",
            ));
        }

        self.multiplicity += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamsBuilder;
    use crate::resource::ResourceKey;

    fn collapsible_task() -> Task {
        Task::builder("APPLY")
            .parameters_builder(ParamsBuilder::new().set("entityId", 100_i64).unwrap())
            .resource_key(ResourceKey::single("ENTITY", "100"))
            .allow_collapse(true)
            .build()
    }

    #[test]
    fn collapsing_three_identical_tasks_yields_multiplicity_three() {
        let mut scheduled = ScheduledTask::new(collapsible_task());
        scheduled.collapse_with(&collapsible_task()).unwrap();
        scheduled.collapse_with(&collapsible_task()).unwrap();

        assert_eq!(scheduled.multiplicity(), 3);
    }

    #[test]
    fn collapsing_rejects_mismatched_signatures() {
        let mut scheduled = ScheduledTask::new(collapsible_task());
        let other = Task::builder("RETIRE").allow_collapse(true).build();
        assert!(scheduled.collapse_with(&other).is_err());
    }

    #[test]
    fn collapsing_rejects_when_either_side_disallows_it() {
        let mut scheduled = ScheduledTask::new(Task::builder("APPLY").build());
        let other = Task::builder("APPLY").allow_collapse(true).build();
        assert!(scheduled.collapse_with(&other).is_err());
    }

    #[test]
    fn new_scheduled_task_starts_unscheduled() {
        let scheduled = ScheduledTask::new(Task::builder("APPLY").build());
        assert_eq!(scheduled.state(), TaskState::Unscheduled);
    }

    #[test]
    fn drives_the_documented_lifecycle_to_a_terminal_state() {
        let scheduled = ScheduledTask::new(Task::builder("APPLY").build());
        scheduled.mark_scheduled().unwrap();
        scheduled.mark_started().unwrap();
        scheduled.mark_successful().unwrap();
        assert_eq!(scheduled.state(), TaskState::Successful);
    }

    #[test]
    fn rejects_starting_a_task_that_was_never_scheduled() {
        let scheduled = ScheduledTask::new(Task::builder("APPLY").build());
        assert!(scheduled.mark_started().is_err());
        assert_eq!(scheduled.state(), TaskState::Unscheduled);
    }

    #[test]
    fn fast_fail_aborts_straight_from_scheduled() {
        let scheduled = ScheduledTask::new(Task::builder("APPLY").build());
        scheduled.mark_scheduled().unwrap();
        scheduled.mark_aborted().unwrap();
        assert_eq!(scheduled.state(), TaskState::Aborted);
    }
}
