// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue-loop integration tests for the task pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskforge_core::config::Config;
use taskforge_core::hub::Hub;
use taskforge_core::model::{Task, TaskStatus};
use taskforge_core::persistence::{MemoryRepository, Repository};
use taskforge_core::pool::TaskPool;
use taskforge_core::runner::secrets::NoKeys;
use taskforge_core::runner::TaskRunner;
use taskforge_core::state::{MemoryTaskState, TaskState};
use taskforge_core::test_support;

/// Delegates to the real state store but refuses every claim, so the
/// test can observe whether the queue loop attempted one.
struct SpyTaskState {
    inner: MemoryTaskState,
    try_claim_calls: AtomicUsize,
}

impl SpyTaskState {
    fn new() -> Self {
        Self {
            inner: MemoryTaskState::new(),
            try_claim_calls: AtomicUsize::new(0),
        }
    }

    fn claim_attempts(&self) -> usize {
        self.try_claim_calls.load(Ordering::SeqCst)
    }
}

impl TaskState for SpyTaskState {
    fn enqueue(&self, runner: Arc<TaskRunner>) {
        self.inner.enqueue(runner)
    }
    fn dequeue(&self) -> Option<Arc<TaskRunner>> {
        self.inner.dequeue()
    }
    fn queue_snapshot(&self) -> Vec<Arc<TaskRunner>> {
        self.inner.queue_snapshot()
    }
    fn remove_queued(&self, task_id: i64) {
        self.inner.remove_queued(task_id)
    }
    fn queue_len(&self) -> usize {
        self.inner.queue_len()
    }
    fn set_running(&self, runner: Arc<TaskRunner>) {
        self.inner.set_running(runner)
    }
    fn clear_running(&self, task_id: i64) {
        self.inner.clear_running(task_id)
    }
    fn running_count(&self) -> usize {
        self.inner.running_count()
    }
    fn running_count_for_project(&self, project_id: i64) -> usize {
        self.inner.running_count_for_project(project_id)
    }
    fn get_running(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.inner.get_running(task_id)
    }
    fn add_active(&self, project_id: i64, runner: Arc<TaskRunner>) {
        self.inner.add_active(project_id, runner)
    }
    fn remove_active(&self, project_id: i64, task_id: i64) {
        self.inner.remove_active(project_id, task_id)
    }
    fn active_count(&self, project_id: i64) -> usize {
        self.inner.active_count(project_id)
    }
    fn set_alias(&self, alias: &str, runner: Arc<TaskRunner>) {
        self.inner.set_alias(alias, runner)
    }
    fn clear_alias(&self, alias: &str) {
        self.inner.clear_alias(alias)
    }
    fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>> {
        self.inner.get_by_alias(alias)
    }

    // Never claim, only count: the test drives the queue loop without
    // actually starting tasks.
    fn try_claim(&self, _task_id: i64) -> bool {
        self.try_claim_calls.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn release_claim(&self, task_id: i64) {
        self.inner.release_claim(task_id)
    }
}

/// A requeued task is removed from the running/active/alias state,
/// stays queued exactly once, and is not retried in the same pass.
#[tokio::test]
async fn test_requeued_event_cleans_running_state_and_skips_immediate_retry() {
    let store = Arc::new(MemoryRepository::new());
    let project = store.create_project(test_support::test_project(0)).await;

    let state = Arc::new(SpyTaskState::new());
    let (pool, rx) = TaskPool::new(
        store.clone(),
        Arc::new(Config::default()),
        state.clone(),
        Hub::start(None),
        Arc::new(NoKeys),
        "test-node".to_string(),
    );
    let pool = Arc::new(pool);

    let runner = test_support::test_runner(42, project.id).await;

    // The state a runner is in right before a requeue lands: marked
    // running, active and aliased.
    state.set_running(runner.clone());
    state.add_active(project.id, runner.clone());
    state.set_alias(&runner.alias, runner.clone());

    let loop_pool = pool.clone();
    let handle = tokio::spawn(async move { loop_pool.handle_queue(rx).await });

    pool.requeue(runner.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.shutdown();
    handle.await.unwrap();

    assert_eq!(
        state.running_count(),
        0,
        "requeued task must be removed from running set"
    );
    assert_eq!(
        state.active_count(project.id),
        0,
        "requeued task must be removed from active-by-project set"
    );
    assert!(
        state.get_by_alias(&runner.alias).is_none(),
        "requeued task alias mapping must be cleared"
    );
    assert_eq!(state.queue_len(), 1, "requeued task must remain queued");
    assert_eq!(
        state.claim_attempts(),
        0,
        "requeued task should not be immediately retried in the same queue pass"
    );
}

/// Full path through the pool: admission, claim, execution of a real
/// shell script, terminal status and index cleanup.
#[tokio::test]
async fn test_shell_task_runs_to_success() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.tmp_dir = tmp.path().to_path_buf();

    let store = Arc::new(MemoryRepository::new());
    let project = store.create_project(test_support::test_project(0)).await;
    let template = store
        .create_template(test_support::shell_template(project.id))
        .await;

    // The shell app runs `sh deploy.sh` inside the project dir.
    let project_dir = tmp.path().join(format!("project_{}", project.id));
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(project_dir.join("deploy.sh"), "echo deployed\nexit 0\n").unwrap();

    let pool = TaskPool::start(
        store.clone(),
        Arc::new(config),
        Arc::new(MemoryTaskState::new()),
        Hub::start(None),
        Arc::new(NoKeys),
        "test-node".to_string(),
    );

    let runner = pool
        .add_task(
            Task::new(project.id, template.id),
            None,
            "",
            project.id,
            false,
        )
        .await
        .unwrap();

    // Wait for the runner to finish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if runner.status().is_finished() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task did not finish in time (status {})",
            runner.status()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // Let the RunFinished event drain.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(runner.status(), TaskStatus::Success);
    assert_eq!(pool.queue_len(), 0);
    assert_eq!(pool.running_count(), 0);

    let stored = store
        .get_task(project.id, runner.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TaskStatus::Success);
    assert!(stored.started.is_some());
    assert!(stored.ended.is_some());

    // The script's output went through the batched writer.
    assert!(store.output_len().await > 0);

    // An audit event was recorded for the terminal status.
    let events = store.events().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].description.contains("SUCCESS"));

    pool.shutdown();
}

/// A failing script yields a terminal `fail` and still cleans up.
#[tokio::test]
async fn test_shell_task_failure_is_terminal_fail() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.tmp_dir = tmp.path().to_path_buf();

    let store = Arc::new(MemoryRepository::new());
    let project = store.create_project(test_support::test_project(0)).await;
    let template = store
        .create_template(test_support::shell_template(project.id))
        .await;

    let project_dir = tmp.path().join(format!("project_{}", project.id));
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(project_dir.join("deploy.sh"), "echo broken >&2\nexit 2\n").unwrap();

    let pool = TaskPool::start(
        store.clone(),
        Arc::new(config),
        Arc::new(MemoryTaskState::new()),
        Hub::start(None),
        Arc::new(NoKeys),
        "test-node".to_string(),
    );

    let runner = pool
        .add_task(
            Task::new(project.id, template.id),
            None,
            "",
            project.id,
            false,
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !runner.status().is_finished() {
        assert!(tokio::time::Instant::now() < deadline, "task did not finish");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(runner.status(), TaskStatus::Fail);
    let events = store.events().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].description.contains("FAIL"));
    assert!(events[0].description.contains("run_error"));

    pool.shutdown();
}
