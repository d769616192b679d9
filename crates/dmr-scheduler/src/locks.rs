//! Process-scoped mutual exclusion over [`ResourceKey`]s.
//!
//! All-or-nothing acquisition in a deterministic total order (the keys'
//! natural ordering) is what lets the scheduler serialize overlapping tasks
//! without ever deadlocking two workers against each other. Each key owns
//! its own FIFO waiter list, so a release only wakes the one task actually
//! queued behind that key rather than every postponed task in the system.

use std::collections::{HashMap, VecDeque};

use dmr_core::{ResourceKey, TaskId};
use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Inner {
    owners: HashMap<ResourceKey, TaskId>,
    waiters: HashMap<ResourceKey, VecDeque<oneshot::Sender<()>>>,
}

pub struct ResourceLocks {
    inner: Mutex<Inner>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                owners: HashMap::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    /// Attempt to acquire every key in `keys` for `owner`. Acquires keys in
    /// their natural sort order and either takes all of them or none.
    ///
    /// On failure, returns the first (in sort order) key that is held by
    /// someone else, so the caller can register as a waiter on exactly that
    /// key via [`Self::register_waiter`].
    pub fn try_acquire(&self, keys: &[ResourceKey], owner: TaskId) -> Result<(), ResourceKey> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut sorted: Vec<&ResourceKey> = keys.iter().collect();
        sorted.sort();

        let mut inner = self.inner.lock();
        for key in &sorted {
            if inner.owners.get(*key).is_some_and(|held_by| *held_by != owner) {
                return Err((*key).clone());
            }
        }
        for key in sorted {
            inner.owners.insert(key.clone(), owner);
        }
        Ok(())
    }

    /// Join the FIFO waiter list for `key`. Call only after `try_acquire`
    /// returned this key as its conflict. The returned receiver resolves
    /// once this waiter has been woken by a matching [`Self::release_all`].
    pub fn register_waiter(&self, key: &ResourceKey) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .waiters
            .entry(key.clone())
            .or_default()
            .push_back(tx);
        rx
    }

    /// Drop every key held by `owner`, waking at most one FIFO waiter per
    /// key that was freed.
    pub fn release_all(&self, owner: TaskId) {
        let mut inner = self.inner.lock();

        let freed: Vec<ResourceKey> = inner
            .owners
            .iter()
            .filter(|(_, held_by)| **held_by == owner)
            .map(|(key, _)| key.clone())
            .collect();
        inner.owners.retain(|_, held_by| *held_by != owner);

        for key in freed {
            let Some(queue) = inner.waiters.get_mut(&key) else {
                continue;
            };
            while let Some(waiter) = queue.pop_front() {
                // A dropped receiver (its task gave up or was already woken
                // by a different key) just moves on to the next waiter.
                if waiter.send(()).is_ok() {
                    break;
                }
            }
            if queue.is_empty() {
                inner.waiters.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn held_key_count(&self) -> usize {
        self.inner.lock().owners.len()
    }
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(component: &str) -> ResourceKey {
        ResourceKey::single("ENTITY", component)
    }

    #[test]
    fn second_owner_cannot_acquire_a_held_key() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();
        let b = TaskId::new();

        assert!(locks.try_acquire(&[key("5")], a).is_ok());
        assert_eq!(locks.try_acquire(&[key("5")], b), Err(key("5")));
    }

    #[test]
    fn release_frees_the_key_for_another_owner() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();
        let b = TaskId::new();

        assert!(locks.try_acquire(&[key("5")], a).is_ok());
        locks.release_all(a);
        assert!(locks.try_acquire(&[key("5")], b).is_ok());
    }

    #[test]
    fn acquisition_is_all_or_nothing() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();
        let b = TaskId::new();

        assert!(locks.try_acquire(&[key("1")], a).is_ok());
        assert!(locks.try_acquire(&[key("1"), key("2")], b).is_err());
        assert_eq!(
            locks.held_key_count(),
            1,
            "a failed all-or-nothing attempt must not leave a partial hold"
        );
    }

    #[test]
    fn same_owner_may_reacquire_its_own_keys() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();

        assert!(locks.try_acquire(&[key("1")], a).is_ok());
        assert!(locks.try_acquire(&[key("1"), key("2")], a).is_ok());
    }

    #[tokio::test]
    async fn release_wakes_exactly_the_waiter_registered_on_the_freed_key() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();
        let b = TaskId::new();

        locks.try_acquire(&[key("1")], a).unwrap();
        let conflict = locks.try_acquire(&[key("1")], b).unwrap_err();
        assert_eq!(conflict, key("1"));

        let waiter = locks.register_waiter(&conflict);
        locks.release_all(a);

        waiter.await.expect("release must fire the waiter for the freed key");
    }

    #[tokio::test]
    async fn releasing_an_unrelated_key_never_wakes_a_waiter_on_another_key() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let c = TaskId::new();

        locks.try_acquire(&[key("1")], a).unwrap();
        locks.try_acquire(&[key("2")], b).unwrap();
        let mut waiter = locks.register_waiter(&key("2"));

        locks.release_all(a);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(
            waiter.try_recv().is_err(),
            "a waiter on key 2 must not be woken by a release of key 1"
        );

        let _ = c;
    }

    #[tokio::test]
    async fn two_waiters_on_the_same_key_are_woken_fifo_one_per_release() {
        let locks = ResourceLocks::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let c = TaskId::new();

        locks.try_acquire(&[key("1")], a).unwrap();
        let first_waiter = locks.register_waiter(&key("1"));
        let mut second_waiter = locks.register_waiter(&key("1"));
        let _ = (b, c);

        locks.release_all(a);
        first_waiter.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(
            second_waiter.try_recv().is_err(),
            "a single release must wake at most one waiter per key"
        );
    }
}
