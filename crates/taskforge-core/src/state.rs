// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process task state store.
//!
//! Four views over in-flight runners (the waiting queue, the running
//! set, the per-project active set and the alias map) plus the claim
//! set backing [`TaskState::try_claim`]. One mutex guards them all;
//! no operation does I/O while holding it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::runner::TaskRunner;

/// State store contract used by the task pool's queue loop.
///
/// `try_claim` is the double-start guard: for a given task id it
/// returns true to exactly one caller until the claim is released
/// (which happens when the task is requeued).
pub trait TaskState: Send + Sync {
    /// Append a runner to the waiting queue tail.
    fn enqueue(&self, runner: Arc<TaskRunner>);
    /// Pop the queue head.
    fn dequeue(&self) -> Option<Arc<TaskRunner>>;
    /// Snapshot of the queue, head first.
    fn queue_snapshot(&self) -> Vec<Arc<TaskRunner>>;
    /// Drop a queued runner by task id.
    fn remove_queued(&self, task_id: i64);
    /// Number of queued runners.
    fn queue_len(&self) -> usize;

    /// Add a runner to the running set.
    fn set_running(&self, runner: Arc<TaskRunner>);
    /// Remove a runner from the running set.
    fn clear_running(&self, task_id: i64);
    /// Number of running runners.
    fn running_count(&self) -> usize;
    /// Number of running runners belonging to one project.
    fn running_count_for_project(&self, project_id: i64) -> usize;
    /// Look up a running runner by task id.
    fn get_running(&self, task_id: i64) -> Option<Arc<TaskRunner>>;

    /// Track a runner as active (running or waiting) for a project.
    fn add_active(&self, project_id: i64, runner: Arc<TaskRunner>);
    /// Remove a runner from a project's active set.
    fn remove_active(&self, project_id: i64, task_id: i64);
    /// Number of active runners for a project.
    fn active_count(&self, project_id: i64) -> usize;

    /// Register an alias for an in-flight runner.
    fn set_alias(&self, alias: &str, runner: Arc<TaskRunner>);
    /// Drop an alias registration.
    fn clear_alias(&self, alias: &str);
    /// Resolve an alias to its runner.
    fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>>;

    /// Atomically claim a task for starting. Exactly one caller
    /// observes true per id until [`TaskState::release_claim`].
    fn try_claim(&self, task_id: i64) -> bool;
    /// Release a claim so the task can be claimed again after a requeue.
    fn release_claim(&self, task_id: i64);
}

#[derive(Default)]
struct StateInner {
    queue: VecDeque<Arc<TaskRunner>>,
    running: HashMap<i64, Arc<TaskRunner>>,
    active: HashMap<i64, HashMap<i64, Arc<TaskRunner>>>,
    aliases: HashMap<String, Arc<TaskRunner>>,
    claimed: HashSet<i64>,
}

/// The in-memory [`TaskState`] implementation used in production.
#[derive(Default)]
pub struct MemoryTaskState {
    inner: Mutex<StateInner>,
}

impl MemoryTaskState {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        // A poisoned state mutex means a panic mid-operation; the store
        // holds only plain collections, so the data is still coherent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskState for MemoryTaskState {
    fn enqueue(&self, runner: Arc<TaskRunner>) {
        self.lock().queue.push_back(runner);
    }

    fn dequeue(&self) -> Option<Arc<TaskRunner>> {
        self.lock().queue.pop_front()
    }

    fn queue_snapshot(&self) -> Vec<Arc<TaskRunner>> {
        self.lock().queue.iter().cloned().collect()
    }

    fn remove_queued(&self, task_id: i64) {
        self.lock().queue.retain(|r| r.task_id != task_id);
    }

    fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    fn set_running(&self, runner: Arc<TaskRunner>) {
        self.lock().running.insert(runner.task_id, runner);
    }

    fn clear_running(&self, task_id: i64) {
        self.lock().running.remove(&task_id);
    }

    fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    fn running_count_for_project(&self, project_id: i64) -> usize {
        self.lock()
            .running
            .values()
            .filter(|r| r.project_id == project_id)
            .count()
    }

    fn get_running(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.lock().running.get(&task_id).cloned()
    }

    fn add_active(&self, project_id: i64, runner: Arc<TaskRunner>) {
        self.lock()
            .active
            .entry(project_id)
            .or_default()
            .insert(runner.task_id, runner);
    }

    fn remove_active(&self, project_id: i64, task_id: i64) {
        let mut inner = self.lock();
        if let Some(project) = inner.active.get_mut(&project_id) {
            project.remove(&task_id);
            if project.is_empty() {
                inner.active.remove(&project_id);
            }
        }
    }

    fn active_count(&self, project_id: i64) -> usize {
        self.lock()
            .active
            .get(&project_id)
            .map_or(0, |project| project.len())
    }

    fn set_alias(&self, alias: &str, runner: Arc<TaskRunner>) {
        self.lock().aliases.insert(alias.to_string(), runner);
    }

    fn clear_alias(&self, alias: &str) {
        self.lock().aliases.remove(alias);
    }

    fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>> {
        self.lock().aliases.get(alias).cloned()
    }

    fn try_claim(&self, task_id: i64) -> bool {
        self.lock().claimed.insert(task_id)
    }

    fn release_claim(&self, task_id: i64) {
        self.lock().claimed.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_runner;

    #[tokio::test]
    async fn test_queue_fifo_order() {
        let state = MemoryTaskState::new();
        let first = test_runner(1, 1).await;
        let second = test_runner(2, 1).await;

        state.enqueue(first.clone());
        state.enqueue(second.clone());
        assert_eq!(state.queue_len(), 2);

        assert_eq!(state.dequeue().unwrap().task_id, 1);
        assert_eq!(state.dequeue().unwrap().task_id, 2);
        assert!(state.dequeue().is_none());
    }

    #[tokio::test]
    async fn test_remove_queued() {
        let state = MemoryTaskState::new();
        state.enqueue(test_runner(1, 1).await);
        state.enqueue(test_runner(2, 1).await);

        state.remove_queued(1);
        let snapshot = state.queue_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].task_id, 2);
    }

    #[tokio::test]
    async fn test_running_and_active_views() {
        let state = MemoryTaskState::new();
        let runner = test_runner(7, 3).await;

        state.set_running(runner.clone());
        state.add_active(3, runner.clone());
        assert_eq!(state.running_count(), 1);
        assert_eq!(state.active_count(3), 1);
        assert_eq!(state.active_count(4), 0);
        assert!(state.get_running(7).is_some());

        state.clear_running(7);
        state.remove_active(3, 7);
        assert_eq!(state.running_count(), 0);
        assert_eq!(state.active_count(3), 0);
    }

    #[tokio::test]
    async fn test_alias_registry() {
        let state = MemoryTaskState::new();
        let runner = test_runner(9, 1).await;

        state.set_alias("alias-9", runner);
        assert_eq!(state.get_by_alias("alias-9").unwrap().task_id, 9);
        assert!(state.get_by_alias("alias-8").is_none());

        state.clear_alias("alias-9");
        assert!(state.get_by_alias("alias-9").is_none());
    }

    #[tokio::test]
    async fn test_try_claim_single_winner() {
        let state = MemoryTaskState::new();
        assert!(state.try_claim(42));
        assert!(!state.try_claim(42));

        state.release_claim(42);
        assert!(state.try_claim(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_try_claim_single_winner_concurrent() {
        let state = Arc::new(MemoryTaskState::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = state.clone();
            handles.push(tokio::spawn(
                async move { state.try_claim(42) as usize },
            ));
        }

        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap();
        }
        assert_eq!(winners, 1, "exactly one claimer must win");
    }
}
