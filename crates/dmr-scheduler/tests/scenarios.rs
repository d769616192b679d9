//! End-to-end scheduling scenarios exercising admission, collapse,
//! resource serialization, fast-fail, and the concurrency cap together
//! rather than one component in isolation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dmr_core::{ParamMap, ResourceKey, Task, TaskBuilder, TaskGroup};
use dmr_scheduler::{
    FollowUpScheduler, FollowUpStore, SchedulerConfig, SchedulingService, SqliteFollowUpStore, TaskHandler,
};
use parking_lot::Mutex;
use sqlx::SqlitePool;

struct Invocation {
    action: String,
    multiplicity: u32,
}

#[derive(Default)]
struct TestState {
    invocations: Mutex<Vec<Invocation>>,
    intervals: Mutex<Vec<(String, Instant, Instant)>>,
    fail_actions: Mutex<HashSet<String>>,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    hold: Mutex<Duration>,
}

struct TestHandler(Arc<TestState>);

#[async_trait]
impl TaskHandler for TestHandler {
    async fn wait_until_ready(&self, _timeout: Duration) -> bool {
        true
    }

    async fn handle_task(
        &self,
        action: &str,
        _parameters: &ParamMap,
        multiplicity: u32,
        _follow_ups: &FollowUpScheduler,
    ) -> bool {
        let now_in = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_seen.fetch_max(now_in, Ordering::SeqCst);

        let start = Instant::now();
        let hold = *self.0.hold.lock();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        let end = Instant::now();

        self.0.current.fetch_sub(1, Ordering::SeqCst);
        self.0
            .invocations
            .lock()
            .push(Invocation { action: action.to_string(), multiplicity });
        self.0
            .intervals
            .lock()
            .push((action.to_string(), start, end));

        !self.0.fail_actions.lock().contains(action)
    }
}

async fn follow_up_store() -> Arc<SqliteFollowUpStore> {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = SqliteFollowUpStore::new(pool);
    store.ensure_schema(false).await.unwrap();
    Arc::new(store)
}

fn entity_task(entity_id: &str, action: &str, group: &Arc<TaskGroup>) -> Task {
    TaskBuilder::new(action)
        .resource_key(ResourceKey::single("ENTITY", entity_id))
        .task_group(group.id())
        .allow_collapse(true)
        .build()
}

/// S1: three collapsible group tasks with the same signature produce
/// exactly one `handle_task` call with `multiplicity == 3`.
#[tokio::test]
async fn collapses_identical_group_tasks_into_one_dispatch() {
    let state = Arc::new(TestState::default());
    let handler = Arc::new(TestHandler(state.clone()));
    let store = follow_up_store().await;

    let scheduler = SchedulingService::new(
        SchedulerConfig {
            concurrency: 2,
            ..Default::default()
        },
        handler,
        store,
    );
    scheduler.init(Duration::from_secs(1)).await.unwrap();

    let group = Arc::new(TaskGroup::new(false));
    let tasks = vec![
        entity_task("100", "APPLY", &group),
        entity_task("100", "APPLY", &group),
        entity_task("100", "APPLY", &group),
    ];
    scheduler.commit_and_await(&group, tasks).await.unwrap();

    let invocations = state.invocations.lock();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].action, "APPLY");
    assert_eq!(invocations[0].multiplicity, 3);

    scheduler.destroy(Duration::from_secs(1)).await;
}

/// S2: two tasks sharing a resource key never run concurrently, regardless
/// of worker count.
#[tokio::test]
async fn serializes_tasks_sharing_a_resource_key() {
    let state = Arc::new(TestState::default());
    *state.hold.lock() = Duration::from_millis(30);
    let handler = Arc::new(TestHandler(state.clone()));
    let store = follow_up_store().await;

    let scheduler = SchedulingService::new(
        SchedulerConfig {
            concurrency: 4,
            postponed_timeout: Duration::from_millis(20),
            ..Default::default()
        },
        handler,
        store,
    );
    scheduler.init(Duration::from_secs(1)).await.unwrap();

    let group = Arc::new(TaskGroup::new(false));
    let a = TaskBuilder::new("A")
        .resource_key(ResourceKey::single("ENTITY", "5"))
        .task_group(group.id())
        .build();
    let b = TaskBuilder::new("B")
        .resource_key(ResourceKey::single("ENTITY", "5"))
        .task_group(group.id())
        .build();
    scheduler.commit_and_await(&group, vec![a, b]).await.unwrap();

    let intervals = state.intervals.lock();
    assert_eq!(intervals.len(), 2);
    let (_, a_start, a_end) = intervals[0];
    let (_, b_start, b_end) = intervals[1];
    let overlap = a_start < b_end && b_start < a_end;
    assert!(!overlap, "tasks sharing a resource key must not overlap");

    scheduler.destroy(Duration::from_secs(1)).await;
}

/// S4: fast-fail aborts tasks in the same group that were never dispatched.
#[tokio::test]
async fn fast_fail_aborts_undispatched_siblings() {
    let state = Arc::new(TestState::default());
    state.fail_actions.lock().insert("A".to_string());
    let handler = Arc::new(TestHandler(state.clone()));
    let store = follow_up_store().await;

    // concurrency == 1 makes dispatch order deterministic: A, then B, then C.
    let scheduler = SchedulingService::new(
        SchedulerConfig {
            concurrency: 1,
            ..Default::default()
        },
        handler,
        store,
    );
    scheduler.init(Duration::from_secs(1)).await.unwrap();

    let group = Arc::new(TaskGroup::new(true));
    let a = TaskBuilder::new("A")
        .resource_key(ResourceKey::single("ENTITY", "1"))
        .task_group(group.id())
        .build();
    let b = TaskBuilder::new("B")
        .resource_key(ResourceKey::single("ENTITY", "2"))
        .task_group(group.id())
        .build();
    let c = TaskBuilder::new("C")
        .resource_key(ResourceKey::single("ENTITY", "3"))
        .task_group(group.id())
        .build();
    let final_state = scheduler.commit_and_await(&group, vec![a, b, c]).await.unwrap();

    assert_eq!(final_state, dmr_core::GroupState::Failed);
    assert_eq!(group.failure_count(), 1);
    assert_eq!(group.aborted_count(), 2);
    assert_eq!(group.success_count(), 0);

    scheduler.destroy(Duration::from_secs(1)).await;
}

/// S6: with `concurrency == 2`, ten disjoint-resource tasks never run more
/// than two at a time.
#[tokio::test]
async fn concurrency_cap_limits_simultaneous_dispatch() {
    let state = Arc::new(TestState::default());
    *state.hold.lock() = Duration::from_millis(25);
    let handler = Arc::new(TestHandler(state.clone()));
    let store = follow_up_store().await;

    let scheduler = SchedulingService::new(
        SchedulerConfig {
            concurrency: 2,
            ..Default::default()
        },
        handler,
        store,
    );
    scheduler.init(Duration::from_secs(1)).await.unwrap();

    let group = Arc::new(TaskGroup::new(false));
    let tasks: Vec<Task> = (0..10)
        .map(|i| {
            TaskBuilder::new("APPLY")
                .resource_key(ResourceKey::single("ENTITY", i.to_string()))
                .task_group(group.id())
                .build()
        })
        .collect();
    scheduler.commit_and_await(&group, tasks).await.unwrap();

    assert!(state.max_seen.load(Ordering::SeqCst) <= 2);
    assert_eq!(state.invocations.lock().len(), 10);

    scheduler.destroy(Duration::from_secs(1)).await;
}

/// S3: a follow-up task that is leased but never completed (simulating a
/// crashed dispatcher) is reclaimed and redelivered exactly once after its
/// lease expires, never duplicated by a concurrent enqueue in the meantime.
#[tokio::test]
async fn follow_up_survives_a_simulated_crash() {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = SqliteFollowUpStore::new(pool);
    store.ensure_schema(false).await.unwrap();

    let task = TaskBuilder::new("F")
        .resource_key(ResourceKey::single("ENTITY", "7"))
        .allow_collapse(false)
        .build();
    store.enqueue_follow_up_task(&task).await.unwrap();

    // Simulate a crash: lease the row, then never complete it.
    let leased = store
        .dequeue_follow_up_tasks(10, Duration::from_millis(0))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);

    // Enqueuing the same non-collapsible action again while the row is
    // still (expired-)leased must not merge into it or be silently lost.
    store.enqueue_follow_up_task(&task).await.unwrap();

    let redelivered = store
        .dequeue_follow_up_tasks(10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(
        redelivered.len(),
        2,
        "the expired lease must be reclaimed and the fresh enqueue must also be leasable"
    );
}

/// A follow-up handler that runs longer than `followUpTimeout` must have its
/// lease renewed mid-flight, so the row never becomes reclaimable (and thus
/// re-dispatchable) while still being handled.
#[tokio::test]
async fn follow_up_lease_is_renewed_during_a_long_running_handler() {
    let state = Arc::new(TestState::default());
    *state.hold.lock() = Duration::from_millis(150);
    let handler = Arc::new(TestHandler(state.clone()));

    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = Arc::new(SqliteFollowUpStore::new(pool));
    store.ensure_schema(false).await.unwrap();

    let task = TaskBuilder::new("F")
        .resource_key(ResourceKey::single("ENTITY", "9"))
        .allow_collapse(false)
        .build();
    store.enqueue_follow_up_task(&task).await.unwrap();

    let scheduler = SchedulingService::new(
        SchedulerConfig {
            concurrency: 1,
            follow_up_timeout: Duration::from_millis(50),
            follow_up_delay: Duration::from_millis(10),
            follow_up_fetch: 10,
            ..Default::default()
        },
        handler,
        store.clone(),
    );
    scheduler.init(Duration::from_secs(1)).await.unwrap();

    // Give the poller time to pick up and dispatch the task, then probe
    // partway through the hold (past the original, un-renewed timeout) that
    // the row is still leased and cannot be redelivered to anyone else.
    tokio::time::sleep(Duration::from_millis(70)).await;
    let mid_flight = store
        .dequeue_follow_up_tasks(10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(
        mid_flight.is_empty(),
        "lease must have been renewed, not left to expire mid-handler"
    );

    // Wait for the handler to finish and the row to be deleted.
    for _ in 0..50 {
        if store.count_scheduled_follow_up_tasks().await == Some(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.count_scheduled_follow_up_tasks().await, Some(0));
    assert_eq!(state.invocations.lock().len(), 1, "handler must run exactly once");

    scheduler.destroy(Duration::from_secs(1)).await;
}
