//! [`TaskGroup`]: the bag of tasks submitted together by one `commit` call.
//! Modeled as a mutex-guarded accounting struct plus a [`tokio::sync::Notify`]
//! that wakes `await_completion` callers: a boolean-ish state guarded by an
//! atomic, paired with a `Notify` for waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::stats::{StatValue, Statistics};
use crate::task::TaskGroupId;

/// The lifecycle of a [`TaskGroup`]:
/// `OPEN -> (CLOSING =>) SCHEDULING -> SCHEDULED -> (SUCCESSFUL | FAILED)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Open,
    Closing,
    Scheduling,
    Scheduled,
    Successful,
    Failed,
}

impl GroupState {
    pub fn is_terminal(self) -> bool {
        matches!(self, GroupState::Successful | GroupState::Failed)
    }
}

#[derive(Debug)]
struct Counts {
    task_count: u64,
    scheduled_count: u64,
    started_count: u64,
    success_count: u64,
    failure_count: u64,
    aborted_count: u64,
}

impl Counts {
    fn pending(&self) -> u64 {
        self.task_count
            - self.success_count
            - self.failure_count
            - self.aborted_count
    }
}

#[derive(Debug)]
struct Inner {
    state: GroupState,
    counts: Counts,
    created_at: Instant,
    closed_at: Option<Instant>,
    scheduled_at: Option<Instant>,
    finished_at: Option<Instant>,
    first_pending_at: Option<Instant>,
    total_handling: Duration,
    longest_handling: Option<Duration>,
}

/// A bag of related tasks submitted together, e.g. all tasks born from one
/// INFO message.
pub struct TaskGroup {
    id: TaskGroupId,
    fast_fail: bool,
    inner: Mutex<Inner>,
    notify: Notify,
    has_failed: AtomicBool,
}

impl TaskGroup {
    pub fn new(fast_fail: bool) -> Self {
        Self {
            id: TaskGroupId::new(),
            fast_fail,
            inner: Mutex::new(Inner {
                state: GroupState::Open,
                counts: Counts {
                    task_count: 0,
                    scheduled_count: 0,
                    started_count: 0,
                    success_count: 0,
                    failure_count: 0,
                    aborted_count: 0,
                },
                created_at: Instant::now(),
                closed_at: None,
                scheduled_at: None,
                finished_at: None,
                first_pending_at: None,
                total_handling: Duration::ZERO,
                longest_handling: None,
            }),
            notify: Notify::new(),
            has_failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TaskGroupId {
        self.id
    }

    pub fn fast_fail(&self) -> bool {
        self.fast_fail
    }

    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    /// Whether fast-fail has already tripped for this group. Once true, the
    /// scheduler should abort any task it has not yet dispatched.
    pub fn has_failed(&self) -> bool {
        self.has_failed.load(Ordering::Acquire)
    }

    /// Register one more task as belonging to this (still-`OPEN`) group.
    pub fn add_task(&self) {
        let mut inner = self.inner.lock();
        inner.counts.task_count += 1;
    }

    /// Mark a task `SCHEDULED`. Called atomically for every task admitted in
    /// one `commit`.
    pub fn mark_scheduled(&self) {
        let mut inner = self.inner.lock();
        inner.counts.scheduled_count += 1;
    }

    pub fn mark_started(&self) {
        let mut inner = self.inner.lock();
        inner.counts.started_count += 1;
        if inner.first_pending_at.is_none() {
            inner.first_pending_at = Some(Instant::now());
        }
    }

    /// Record a task's terminal result and its handling duration (time spent
    /// between `STARTED` and completion). Returns `true` if the group reached
    /// a terminal state as a result of this call.
    pub fn record_result(&self, success: bool, handling_time: Duration) -> bool {
        {
            let mut inner = self.inner.lock();
            if success {
                inner.counts.success_count += 1;
            } else {
                inner.counts.failure_count += 1;
            }
            inner.total_handling += handling_time;
            inner.longest_handling = Some(match inner.longest_handling {
                Some(prev) if prev >= handling_time => prev,
                _ => handling_time,
            });
        }

        if !success && self.fast_fail {
            self.has_failed.store(true, Ordering::Release);
        }

        self.check_completion()
    }

    /// Abort every task that was never dispatched, because fast-fail tripped.
    /// Returns the number of tasks marked `ABORTED`.
    pub fn abort_remaining(&self) -> u64 {
        let mut inner = self.inner.lock();
        let pending = inner.counts.pending();
        // Only unstarted tasks can be aborted; started tasks run to
        // completion regardless of fast-fail.
        let abortable = pending.saturating_sub(
            inner
                .counts
                .started_count
                .saturating_sub(inner.counts.success_count + inner.counts.failure_count),
        );
        inner.counts.aborted_count += abortable;
        drop(inner);

        if abortable > 0 {
            self.check_completion();
        }

        abortable
    }

    /// Transition `OPEN`/`CLOSING` -> `SCHEDULING` -> `SCHEDULED`, or
    /// straight to `SUCCESSFUL` if the group turned out to be empty.
    ///
    /// Must be called once admission for this group's `commit` call has
    /// finished.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed_at = Some(Instant::now());

        if inner.counts.task_count == 0 {
            inner.state = GroupState::Successful;
            inner.finished_at = inner.closed_at;
            drop(inner);
            self.notify.notify_waiters();
            return;
        }

        inner.state = GroupState::Scheduling;
        if inner.counts.scheduled_count == inner.counts.task_count {
            inner.state = GroupState::Scheduled;
            inner.scheduled_at = Some(Instant::now());
        }
        drop(inner);
        self.check_completion();
    }

    /// Re-checks the completion predicate (`pending == 0`, or `FAILED` with
    /// fast-fail already tripped) and transitions to a terminal state if
    /// satisfied. Safe to call redundantly.
    fn check_completion(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }

        let pending = inner.counts.pending();
        let should_finish = pending == 0 || (self.has_failed() && inner.counts.started_count == inner.counts.success_count + inner.counts.failure_count);

        if !should_finish {
            return false;
        }

        inner.state = if self.has_failed() {
            GroupState::Failed
        } else {
            GroupState::Successful
        };
        inner.finished_at = Some(Instant::now());
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    /// Block until the group reaches a terminal state.
    pub async fn await_completion(&self) {
        loop {
            if self.state().is_terminal() {
                return;
            }
            let notified = self.notify.notified();
            if self.state().is_terminal() {
                return;
            }
            notified.await;
        }
    }

    pub fn task_count(&self) -> u64 {
        self.inner.lock().counts.task_count
    }

    pub fn pending_count(&self) -> u64 {
        self.inner.lock().counts.pending()
    }

    pub fn success_count(&self) -> u64 {
        self.inner.lock().counts.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.inner.lock().counts.failure_count
    }

    pub fn aborted_count(&self) -> u64 {
        self.inner.lock().counts.aborted_count
    }

    /// `pendingTime` and `longestHandlingTime` are omitted if the group never
    /// had a pending task / never completed a task, respectively.
    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock();
        let mut stats = Statistics::new();

        let now = Instant::now();
        let open_time = inner.closed_at.unwrap_or(now) - inner.created_at;
        stats.insert(
            "openTime".into(),
            StatValue::ms(open_time.as_secs_f64() * 1000.0),
        );

        if let Some(scheduled_at) = inner.scheduled_at {
            let unscheduled_time = scheduled_at - inner.created_at;
            stats.insert(
                "unscheduledTime".into(),
                StatValue::ms(unscheduled_time.as_secs_f64() * 1000.0),
            );
        }

        if let Some(first_pending_at) = inner.first_pending_at {
            let end = inner.finished_at.unwrap_or(now);
            if end > first_pending_at {
                stats.insert(
                    "pendingTime".into(),
                    StatValue::ms((end - first_pending_at).as_secs_f64() * 1000.0),
                );
            }
        }

        stats.insert(
            "totalHandlingTime".into(),
            StatValue::ms(inner.total_handling.as_secs_f64() * 1000.0),
        );

        if let Some(longest) = inner.longest_handling {
            stats.insert(
                "longestHandlingTime".into(),
                StatValue::ms(longest.as_secs_f64() * 1000.0),
            );
        }

        let lifespan = now - inner.created_at;
        stats.insert(
            "lifespan".into(),
            StatValue::ms(lifespan.as_secs_f64() * 1000.0),
        );

        let round_trip = inner.finished_at.unwrap_or(now) - inner.created_at;
        stats.insert(
            "roundTripTime".into(),
            StatValue::ms(round_trip.as_secs_f64() * 1000.0),
        );

        stats.insert(
            "taskCount".into(),
            StatValue::count(inner.counts.task_count as f64),
        );
        stats.insert(
            "pendingCount".into(),
            StatValue::count(inner.counts.pending() as f64),
        );
        stats.insert(
            "successCount".into(),
            StatValue::count(inner.counts.success_count as f64),
        );
        stats.insert(
            "failureCount".into(),
            StatValue::count(inner.counts.failure_count as f64),
        );

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_closes_straight_to_successful() {
        let group = TaskGroup::new(true);
        group.close();
        assert_eq!(group.state(), GroupState::Successful);
    }

    #[test]
    fn accounting_invariant_after_completion() {
        let group = TaskGroup::new(true);
        group.add_task();
        group.add_task();
        group.mark_scheduled();
        group.mark_scheduled();
        group.close();
        assert_eq!(group.state(), GroupState::Scheduled);

        group.mark_started();
        group.record_result(true, Duration::from_millis(5));
        group.mark_started();
        group.record_result(true, Duration::from_millis(5));

        assert_eq!(group.state(), GroupState::Successful);
        assert_eq!(group.pending_count(), 0);
        assert_eq!(
            group.success_count() + group.failure_count() + group.aborted_count(),
            group.task_count()
        );
    }

    #[tokio::test]
    async fn await_completion_returns_once_group_is_terminal() {
        let group = TaskGroup::new(true);
        group.add_task();
        group.mark_scheduled();
        group.close();
        group.mark_started();

        let waiter = async {
            group.await_completion().await;
        };
        let completer = async {
            group.record_result(true, Duration::from_millis(1));
        };

        tokio::join!(waiter, completer);
        assert_eq!(group.state(), GroupState::Successful);
    }

    #[test]
    fn fast_fail_marks_group_failed_on_first_failure() {
        let group = TaskGroup::new(true);
        group.add_task();
        group.add_task();
        group.mark_scheduled();
        group.mark_scheduled();
        group.close();

        group.mark_started();
        group.record_result(false, Duration::from_millis(1));
        assert!(group.has_failed());

        let aborted = group.abort_remaining();
        assert_eq!(aborted, 1);
        assert_eq!(group.state(), GroupState::Failed);
    }
}
