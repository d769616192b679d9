//! The scheduling core: admission, in-memory collapse, resource-gated
//! dispatch, and the postponement/follow-up background loops run as a small
//! fleet of cooperating tokio tasks (dispatch workers, a postponement
//! scanner, and a follow-up poller).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dmr_core::{GroupState, ScheduledTask, StatValue, Statistics, Task, TaskGroup, TaskGroupId};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::followup::FollowUpStore;
use crate::handler::{FollowUpScheduler, TaskHandler};
use crate::locks::ResourceLocks;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerState {
    Uninitialized,
    Ready,
    Active,
    Destroying,
    Destroyed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Uninitialized,
    Running,
    Destroying,
    Destroyed,
}

struct PostponedEntry {
    scheduled: ScheduledTask,
    deadline: Instant,
    waiter: Option<tokio::sync::oneshot::Receiver<()>>,
}

struct Queues {
    group_ready: Vec<ScheduledTask>,
    follow_up_ready: Vec<ScheduledTask>,
    postponed: Vec<PostponedEntry>,
}

impl Queues {
    fn new() -> Self {
        Self {
            group_ready: Vec::new(),
            follow_up_ready: Vec::new(),
            postponed: Vec::new(),
        }
    }

    fn pop_ready(&mut self) -> Option<ScheduledTask> {
        if !self.group_ready.is_empty() {
            Some(self.group_ready.remove(0))
        } else if !self.follow_up_ready.is_empty() {
            Some(self.follow_up_ready.remove(0))
        } else {
            None
        }
    }

    fn remaining(&self) -> u64 {
        (self.group_ready.len() + self.follow_up_ready.len() + self.postponed.len()) as u64
    }

    /// Drop every queued occurrence of `group_id`'s tasks, e.g. after a
    /// fast-fail trip, marking each one `ABORTED` on its way out. Returns
    /// how many were dropped.
    fn drop_group(&mut self, group_id: TaskGroupId) -> u64 {
        let mut dropped = 0u64;
        self.group_ready.retain(|s| {
            let belongs = s.task().task_group() == Some(group_id);
            if belongs {
                let _ = s.mark_aborted();
                dropped += 1;
            }
            !belongs
        });
        self.postponed.retain(|entry| {
            let belongs = entry.scheduled.task().task_group() == Some(group_id);
            if belongs {
                let _ = entry.scheduled.mark_aborted();
                dropped += 1;
            }
            !belongs
        });
        dropped
    }
}

/// The generic, at-least-once, resource-locked task scheduler.
pub struct SchedulingService {
    config: SchedulerConfig,
    handler: Arc<dyn TaskHandler>,
    follow_up_store: Arc<dyn FollowUpStore>,
    locks: Arc<ResourceLocks>,

    lifecycle: Mutex<Lifecycle>,
    queues: Mutex<Queues>,
    groups: Mutex<HashMap<TaskGroupId, Arc<TaskGroup>>>,
    ready_notify: Notify,
    shutdown_notify: Notify,

    active_count: AtomicU64,
    task_complete_count: AtomicU64,
    task_success_count: AtomicU64,
    last_task_activity_nanos: AtomicI64,

    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulingService {
    pub fn new(
        config: SchedulerConfig,
        handler: Arc<dyn TaskHandler>,
        follow_up_store: Arc<dyn FollowUpStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            follow_up_store,
            locks: Arc::new(ResourceLocks::new()),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            queues: Mutex::new(Queues::new()),
            groups: Mutex::new(HashMap::new()),
            ready_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            active_count: AtomicU64::new(0),
            task_complete_count: AtomicU64::new(0),
            task_success_count: AtomicU64::new(0),
            last_task_activity_nanos: AtomicI64::new(-1),
            background: Mutex::new(Vec::new()),
        })
    }

    /// `init` requires `UNINITIALIZED`. Blocks on the handler's own
    /// readiness check, then starts `concurrency` dispatch workers plus the
    /// postponement scanner and follow-up poller.
    pub async fn init(self: &Arc<Self>, ready_timeout: Duration) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Uninitialized {
                return Err(Error::invalid_state("init requires the UNINITIALIZED state"));
            }
            *lifecycle = Lifecycle::Running;
        }

        if !self.handler.wait_until_ready(ready_timeout).await {
            let mut lifecycle = self.lifecycle.lock();
            *lifecycle = Lifecycle::Uninitialized;
            return Err(Error::invalid_state("handler did not become ready in time"));
        }

        let mut handles = Vec::with_capacity(self.config.concurrency + 3);
        for worker_id in 0..self.config.concurrency {
            let this = self.clone();
            handles.push(tokio::spawn(
                async move { this.worker_loop(worker_id).await }
                    .instrument(info_span!("dmr_worker", worker_id)),
            ));
        }

        {
            let this = self.clone();
            handles.push(tokio::spawn(
                async move { this.postponement_loop().await }.instrument(info_span!("dmr_postponement_scanner")),
            ));
        }
        {
            let this = self.clone();
            handles.push(tokio::spawn(
                async move { this.follow_up_poll_loop().await }.instrument(info_span!("dmr_follow_up_poller")),
            ));
        }
        {
            let this = self.clone();
            handles.push(tokio::spawn(
                async move { this.summary_log_loop().await }.instrument(info_span!("dmr_summary_log")),
            ));
        }

        *self.background.lock() = handles;
        Ok(())
    }

    /// Logs pending/active/success/failure counters at a fixed interval
    /// until shutdown, so an operator tailing logs can see throughput
    /// without polling `statistics()`.
    async fn summary_log_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                _ = self.shutdown_notify.notified() => return,
            }

            let remaining = self.get_all_remaining_tasks_count().await;
            let active = self.active_count.load(Ordering::Acquire);
            let complete = self.task_complete_count.load(Ordering::Acquire);
            let success = self.task_success_count.load(Ordering::Acquire);
            info!(
                remaining,
                active,
                complete,
                success,
                failed = complete - success,
                "scheduler summary"
            );
        }
    }

    pub fn state(&self) -> SchedulerState {
        match *self.lifecycle.lock() {
            Lifecycle::Uninitialized => SchedulerState::Uninitialized,
            Lifecycle::Destroying => SchedulerState::Destroying,
            Lifecycle::Destroyed => SchedulerState::Destroyed,
            Lifecycle::Running => {
                if self.active_count.load(Ordering::Acquire) > 0 {
                    SchedulerState::Active
                } else {
                    SchedulerState::Ready
                }
            }
        }
    }

    fn is_accepting_work(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running)
    }

    /// Admit every task in `tasks` — all of which must belong to `group` —
    /// atomically with respect to the group's state machine, then close the
    /// group. Tasks sharing a signature with an already-pending
    /// `ScheduledTask` are collapsed when both allow it.
    pub fn commit(&self, group: &Arc<TaskGroup>, tasks: Vec<Task>) -> Result<()> {
        if !self.is_accepting_work() {
            return Err(Error::invalid_state("scheduler is not accepting new work"));
        }

        self.groups.lock().insert(group.id(), group.clone());

        let mut queues = self.queues.lock();
        for task in tasks {
            group.add_task();

            let collapsed = task.allow_collapse()
                && queues.group_ready.iter_mut().any(|existing| {
                    if existing.task().signature() == task.signature() && existing.task().allow_collapse() {
                        existing.collapse_with(&task).is_ok()
                    } else {
                        false
                    }
                });

            if !collapsed {
                let scheduled = ScheduledTask::new(task);
                scheduled
                    .mark_scheduled()
                    .expect("a freshly constructed task is always UNSCHEDULED");
                queues.group_ready.push(scheduled);
            }
            group.mark_scheduled();
        }
        drop(queues);

        group.close();
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Submit a standalone follow-up task, persisting it to the durable
    /// store (collapsing with an existing un-leased row when possible).
    pub async fn schedule_follow_up(&self, task: Task) -> Result<()> {
        if !self.is_accepting_work() {
            return Err(Error::invalid_state("scheduler is not accepting new work"));
        }
        self.follow_up_store.enqueue_follow_up_task(&task).await
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if matches!(*self.lifecycle.lock(), Lifecycle::Destroying | Lifecycle::Destroyed) {
                return;
            }

            let next = self.queues.lock().pop_ready();
            match next {
                Some(scheduled) => self.dispatch(scheduled).await,
                None => {
                    tokio::select! {
                        _ = self.ready_notify.notified() => {}
                        _ = tokio::time::sleep(self.config.standard_timeout) => {}
                        _ = self.shutdown_notify.notified() => {
                            info!(worker_id, "worker exiting on shutdown signal");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, scheduled: ScheduledTask) {
        let owner = scheduled.task().id();

        if let Err(conflict) = self.locks.try_acquire(scheduled.task().resource_keys(), owner) {
            let waiter = self.locks.register_waiter(&conflict);
            let deadline = Instant::now() + self.config.postponed_timeout;
            self.queues.lock().postponed.push(PostponedEntry {
                scheduled,
                deadline,
                waiter: Some(waiter),
            });
            return;
        }

        self.active_count.fetch_add(1, Ordering::AcqRel);
        self.last_task_activity_nanos
            .store(now_nanos(), Ordering::Release);
        if let Err(err) = scheduled.mark_started() {
            warn!(%err, task_id = %scheduled.task().id(), "dispatching a task from an unexpected state");
        }

        let group = scheduled
            .task()
            .task_group()
            .and_then(|id| self.groups.lock().get(&id).cloned());

        let follow_ups = FollowUpScheduler::new(self.follow_up_store.clone());
        let started = Instant::now();
        let handle_fut = self.handler.handle_task(
            scheduled.task().action(),
            scheduled.task().parameters(),
            scheduled.multiplicity(),
            &follow_ups,
        );

        let success = match scheduled.follow_up_id() {
            Some(follow_up_id) => {
                self.handle_with_lease_renewal(follow_up_id, handle_fut).await
            }
            None => handle_fut.await,
        };
        let elapsed = started.elapsed();

        let transition_result = if success {
            scheduled.mark_successful()
        } else {
            scheduled.mark_failed()
        };
        if let Err(err) = transition_result {
            warn!(%err, task_id = %scheduled.task().id(), "task completed from an unexpected state");
        }

        self.locks.release_all(owner);
        self.task_complete_count.fetch_add(1, Ordering::AcqRel);
        if success {
            self.task_success_count.fetch_add(1, Ordering::AcqRel);
        }

        if let Some(group) = group {
            self.record_group_result(&group, success, elapsed, scheduled.multiplicity());
        } else if let Some(follow_up_id) = scheduled.follow_up_id() {
            if success {
                if let Err(err) = self.follow_up_store.complete_follow_up_task(follow_up_id).await {
                    error!(%err, follow_up_id, "failed to complete follow-up task after success");
                }
            } else {
                warn!(follow_up_id, "follow-up handler failed, leaving lease to expire for re-delivery");
            }
        }

        self.active_count.fetch_sub(1, Ordering::AcqRel);
        self.ready_notify.notify_waiters();
    }

    /// Runs `handle_fut` to completion, renewing the durable lease on
    /// `follow_up_id` at half of `followUpTimeout` so a handler that runs
    /// close to the timeout never has its row reclaimed out from under it.
    async fn handle_with_lease_renewal(
        &self,
        follow_up_id: i64,
        handle_fut: impl Future<Output = bool>,
    ) -> bool {
        let renew_every = self.config.follow_up_timeout / 2;
        tokio::pin!(handle_fut);
        loop {
            tokio::select! {
                result = &mut handle_fut => return result,
                _ = tokio::time::sleep(renew_every) => {
                    if let Err(err) = self
                        .follow_up_store
                        .renew_follow_up_tasks(&[follow_up_id], self.config.follow_up_timeout)
                        .await
                    {
                        warn!(%err, follow_up_id, "failed to renew follow-up lease, continuing to wait");
                    }
                }
            }
        }
    }

    fn record_group_result(
        &self,
        group: &Arc<TaskGroup>,
        success: bool,
        elapsed: Duration,
        multiplicity: u32,
    ) {
        for _ in 0..multiplicity.max(1) {
            group.mark_started();
            group.record_result(success, elapsed);
        }

        if !success && group.has_failed() {
            let aborted = group.abort_remaining();
            if aborted > 0 {
                let dropped = self.queues.lock().drop_group(group.id());
                info!(
                    group_id = %group.id(),
                    aborted,
                    dropped_from_queues = dropped,
                    "fast-fail aborted remaining tasks in group"
                );
            }
        }

        if group.state().is_terminal() {
            self.groups.lock().remove(&group.id());
        }
    }

    async fn postponement_loop(self: Arc<Self>) {
        loop {
            // Collect this round's per-key wakeup receivers so a release can
            // wake the scanner promptly instead of it idling for the full
            // `postponed_timeout`.
            let mut wake_on_release: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();
            {
                let mut queues = self.queues.lock();
                for entry in queues.postponed.iter_mut() {
                    if let Some(waiter) = entry.waiter.take() {
                        wake_on_release.spawn(async move {
                            let _ = waiter.await;
                        });
                    }
                }
            }

            let mut woken_by_release = false;
            tokio::select! {
                _ = tokio::time::sleep(self.config.postponed_timeout) => {}
                _ = wake_on_release.join_next(), if !wake_on_release.is_empty() => {
                    woken_by_release = true;
                }
                _ = self.shutdown_notify.notified() => return,
            }
            wake_on_release.abort_all();

            let now = Instant::now();
            let due = {
                let mut queues = self.queues.lock();
                let mut due = Vec::new();
                let mut i = 0;
                while i < queues.postponed.len() {
                    if woken_by_release || queues.postponed[i].deadline <= now {
                        due.push(queues.postponed.remove(i).scheduled);
                    } else {
                        i += 1;
                    }
                }
                due
            };

            // Retry acquisition for every due entry; `dispatch` pushes it
            // straight back onto the postponed list (with a fresh waiter
            // registration) if it still can't acquire its resources.
            for scheduled in due {
                self.dispatch(scheduled).await;
            }
        }
    }

    async fn follow_up_poll_loop(self: Arc<Self>) {
        loop {
            if matches!(*self.lifecycle.lock(), Lifecycle::Destroying | Lifecycle::Destroyed) {
                return;
            }

            match self
                .follow_up_store
                .dequeue_follow_up_tasks(self.config.follow_up_fetch, self.config.follow_up_timeout)
                .await
            {
                Ok(leased) if !leased.is_empty() => {
                    for scheduled in &leased {
                        if let Err(err) = scheduled.mark_scheduled() {
                            warn!(%err, "leased follow-up task had unexpected state");
                        }
                    }
                    let mut queues = self.queues.lock();
                    queues.follow_up_ready.extend(leased);
                    drop(queues);
                    self.ready_notify.notify_waiters();
                }
                Ok(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.follow_up_delay) => {}
                        _ = self.shutdown_notify.notified() => return,
                    }
                }
                Err(err) => {
                    error!(%err, "follow-up poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.follow_up_delay) => {}
                        _ = self.shutdown_notify.notified() => return,
                    }
                }
            }
        }
    }

    /// Idempotent. Transitions to `DESTROYING`, wakes every background
    /// loop, waits up to `grace_period` for in-flight handlers, then to
    /// `DESTROYED`.
    pub async fn destroy(self: &Arc<Self>, grace_period: Duration) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Destroying | Lifecycle::Destroyed) {
                return;
            }
            *lifecycle = Lifecycle::Destroying;
        }

        self.shutdown_notify.notify_waiters();
        self.ready_notify.notify_waiters();

        let handles = std::mem::take(&mut *self.background.lock());
        let join_all = futures_join_all(handles);
        if tokio::time::timeout(grace_period, join_all).await.is_err() {
            warn!("scheduler destroy grace period elapsed with handlers still running");
        }

        *self.lifecycle.lock() = Lifecycle::Destroyed;
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::new();
        stats.insert("concurrency".into(), StatValue::count(self.config.concurrency as f64));
        stats.insert(
            "standardTimeout".into(),
            StatValue::ms(self.config.standard_timeout.as_secs_f64() * 1000.0),
        );
        stats.insert(
            "postponedTimeout".into(),
            StatValue::ms(self.config.postponed_timeout.as_secs_f64() * 1000.0),
        );
        stats.insert(
            "followUpDelay".into(),
            StatValue::ms(self.config.follow_up_delay.as_secs_f64() * 1000.0),
        );
        stats.insert(
            "followUpTimeout".into(),
            StatValue::ms(self.config.follow_up_timeout.as_secs_f64() * 1000.0),
        );
        stats.insert(
            "taskCompleteCount".into(),
            StatValue::count(self.task_complete_count.load(Ordering::Acquire) as f64),
        );
        stats.insert(
            "taskSuccessCount".into(),
            StatValue::count(self.task_success_count.load(Ordering::Acquire) as f64),
        );
        stats
    }

    /// In-memory ready, postponed, and in-progress (`STARTED`) tasks.
    pub fn get_remaining_tasks_count(&self) -> u64 {
        self.queues.lock().remaining() + self.active_count.load(Ordering::Acquire)
    }

    pub async fn get_remaining_follow_up_tasks_count(&self) -> Option<u64> {
        self.follow_up_store.count_scheduled_follow_up_tasks().await
    }

    /// Operator-invoked diagnostic: log the current contents of the durable
    /// follow-up table. Wired up behind `SIGUSR1` in the server binary.
    pub async fn dump_follow_up_table(&self) -> Result<u64> {
        self.follow_up_store.dump_follow_up_table().await
    }

    pub async fn get_all_remaining_tasks_count(&self) -> u64 {
        let in_memory = self.get_remaining_tasks_count();
        let durable = self.get_remaining_follow_up_tasks_count().await.unwrap_or(0);
        in_memory + durable
    }

    pub fn get_last_task_activity_nanos(&self) -> i64 {
        self.last_task_activity_nanos.load(Ordering::Acquire)
    }

    /// Convenience for a common caller shape: admit `tasks` into `group`
    /// and block until the group reaches a terminal state.
    pub async fn commit_and_await(&self, group: &Arc<TaskGroup>, tasks: Vec<Task>) -> Result<GroupState> {
        self.commit(group, tasks)?;
        group.await_completion().await;
        Ok(group.state())
    }
}

fn now_nanos() -> i64 {
    // A monotonic surrogate for "nanos since scheduler start" is sufficient
    // for liveness comparisons; callers only ever diff two readings.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_nanos() as i64
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
