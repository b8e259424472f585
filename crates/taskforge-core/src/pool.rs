// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task pool: admission control, the queue-draining loop and task
//! stop/confirm surface.
//!
//! One loop consumes [`PoolEvent`]s. `Queued` and `RunFinished` scan
//! the waiting queue for admissible runners; `Requeued` only cleans
//! the running/active/alias/claim state and deliberately does not
//! attempt a claim in the same pass, so a requeued task cannot
//! double-start. Runner panics are caught and converted to a terminal
//! `fail`.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::hub::Hub;
use crate::model::{generate_alias, Task, TaskStatus};
use crate::persistence::Repository;
use crate::runner::secrets::KeyStore;
use crate::runner::{RunnerContext, TaskRunner};
use crate::state::TaskState;

/// What happened to a runner, as seen by the queue loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventKind {
    /// A task entered the waiting queue.
    Queued,
    /// A task went back to the queue tail; clean indexes, no retry in
    /// this pass.
    Requeued,
    /// A runner reached a terminal status.
    RunFinished,
    /// A stop was requested for a task.
    StopRequested,
}

/// One queue-loop event.
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub runner: Arc<TaskRunner>,
}

/// The task pool. Owns admission and the queue loop; runners report
/// back through the pool's event channel.
pub struct TaskPool {
    repo: Arc<dyn Repository>,
    config: Arc<Config>,
    state: Arc<dyn TaskState>,
    hub: Hub,
    keys: Arc<dyn KeyStore>,
    node_id: String,
    events: mpsc::UnboundedSender<PoolEvent>,
    shutdown: Notify,
}

impl TaskPool {
    /// Build a pool plus the receiver its queue loop must consume.
    pub fn new(
        repo: Arc<dyn Repository>,
        config: Arc<Config>,
        state: Arc<dyn TaskState>,
        hub: Hub,
        keys: Arc<dyn KeyStore>,
        node_id: String,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                repo,
                config,
                state,
                hub,
                keys,
                node_id,
                events,
                shutdown: Notify::new(),
            },
            rx,
        )
    }

    /// Build the pool and spawn its queue loop.
    pub fn start(
        repo: Arc<dyn Repository>,
        config: Arc<Config>,
        state: Arc<dyn TaskState>,
        hub: Hub,
        keys: Arc<dyn KeyStore>,
        node_id: String,
    ) -> Arc<Self> {
        let (pool, rx) = Self::new(repo, config, state, hub, keys, node_id);
        let pool = Arc::new(pool);
        let loop_pool = pool.clone();
        tokio::spawn(async move { loop_pool.handle_queue(rx).await });
        pool
    }

    /// Stop the queue loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Number of queued tasks.
    pub fn queue_len(&self) -> usize {
        self.state.queue_len()
    }

    /// Number of running tasks.
    pub fn running_count(&self) -> usize {
        self.state.running_count()
    }

    /// Resolve an in-flight task by alias.
    pub fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>> {
        self.state.get_by_alias(alias)
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Persist a waiting task, register its runner and queue it.
    ///
    /// Fails when the project or template reference is invalid; store
    /// errors during admission surface to the caller.
    pub async fn add_task(
        &self,
        mut task: Task,
        username: Option<String>,
        alias: &str,
        project_id: i64,
        needs_alias: bool,
    ) -> Result<Arc<TaskRunner>> {
        task.project_id = project_id;

        let project = self
            .repo
            .get_project(project_id)
            .await?
            .ok_or(CoreError::MissingDependency {
                kind: "project",
                id: project_id,
            })?;
        let template = self
            .repo
            .get_template(project_id, task.template_id)
            .await?
            .ok_or(CoreError::MissingDependency {
                kind: "template",
                id: task.template_id,
            })?;

        task.status = TaskStatus::Waiting;
        task.node_id = Some(self.node_id.clone());
        let task = self.repo.create_task(task).await?;

        let alias = if !alias.is_empty() {
            alias.to_string()
        } else if needs_alias {
            generate_alias()
        } else {
            String::new()
        };

        let ctx = RunnerContext {
            repo: self.repo.clone(),
            config: self.config.clone(),
            hub: self.hub.clone(),
            keys: self.keys.clone(),
            events: self.events.clone(),
            node_id: self.node_id.clone(),
        };
        let runner = TaskRunner::new(task, template, project, alias.clone(), username, ctx);

        self.state.enqueue(runner.clone());
        self.state.add_active(project_id, runner.clone());
        if !alias.is_empty() {
            self.state.set_alias(&alias, runner.clone());
        }

        info!(
            task_id = runner.task_id,
            project_id,
            template = %runner.template().name,
            "task queued"
        );
        let _ = self.events.send(PoolEvent {
            kind: PoolEventKind::Queued,
            runner: runner.clone(),
        });

        Ok(runner)
    }

    /// Push a runner back to the queue tail. The queue loop cleans its
    /// running-state without retrying it in the same pass.
    pub fn requeue(&self, runner: Arc<TaskRunner>) {
        self.state.enqueue(runner.clone());
        let _ = self.events.send(PoolEvent {
            kind: PoolEventKind::Requeued,
            runner,
        });
    }

    /// Request a stop. Idempotent: repeating the call after the task
    /// finished (or was already stopping, or left the pool entirely)
    /// changes nothing.
    pub async fn stop_task(&self, task_id: i64, force: bool) -> Result<()> {
        let Some(runner) = self.find_runner(task_id) else {
            // Not in flight here; either already finished or never ours.
            return Ok(());
        };

        if runner.status().is_finished() {
            return Ok(());
        }

        runner.kill(force);
        let _ = self.events.send(PoolEvent {
            kind: PoolEventKind::StopRequested,
            runner,
        });
        Ok(())
    }

    /// Resolve a pending plan confirmation.
    pub async fn confirm_task(&self, task_id: i64) -> Result<()> {
        self.resolve_confirmation(task_id, TaskStatus::Confirmed).await
    }

    /// Deny a pending plan confirmation.
    pub async fn reject_task(&self, task_id: i64) -> Result<()> {
        self.resolve_confirmation(task_id, TaskStatus::Rejected).await
    }

    async fn resolve_confirmation(&self, task_id: i64, resolution: TaskStatus) -> Result<()> {
        let Some(runner) = self.find_runner(task_id) else {
            return Err(CoreError::MissingDependency {
                kind: "task",
                id: task_id,
            });
        };

        if runner.status() != TaskStatus::WaitingConfirmation {
            warn!(
                task_id,
                status = %runner.status(),
                "confirmation resolution for a task that is not waiting"
            );
            return Ok(());
        }

        runner.set_status(resolution).await;
        Ok(())
    }

    fn find_runner(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.state.get_running(task_id).or_else(|| {
            self.state
                .queue_snapshot()
                .into_iter()
                .find(|r| r.task_id == task_id)
        })
    }

    // ------------------------------------------------------------------
    // Queue loop
    // ------------------------------------------------------------------

    /// The queue-draining loop. Runs until the event channel closes or
    /// [`TaskPool::shutdown`] is called; pending events are drained
    /// before a shutdown is honored.
    pub async fn handle_queue(&self, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
        loop {
            tokio::select! {
                biased;

                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },

                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn handle_event(&self, event: PoolEvent) {
        match event.kind {
            PoolEventKind::Queued => self.dispatch_ready(),
            PoolEventKind::Requeued => {
                let runner = &event.runner;
                self.state.clear_running(runner.task_id);
                self.state.remove_active(runner.project_id, runner.task_id);
                if !runner.alias.is_empty() {
                    self.state.clear_alias(&runner.alias);
                }
                self.state.release_claim(runner.task_id);
                // No dispatch here: a requeued task must not be
                // claimed again in the same pass.
            }
            PoolEventKind::RunFinished => {
                let runner = &event.runner;
                self.state.clear_running(runner.task_id);
                self.state.remove_active(runner.project_id, runner.task_id);
                if !runner.alias.is_empty() {
                    self.state.clear_alias(&runner.alias);
                }
                self.dispatch_ready();
            }
            PoolEventKind::StopRequested => self.handle_stop(event.runner).await,
        }
    }

    async fn handle_stop(&self, runner: Arc<TaskRunner>) {
        match runner.status() {
            status if status.is_finished() => {}
            TaskStatus::Waiting => {
                // Still queued: terminate without ever starting.
                self.state.remove_queued(runner.task_id);
                self.state.remove_active(runner.project_id, runner.task_id);
                if !runner.alias.is_empty() {
                    self.state.clear_alias(&runner.alias);
                }
                self.state.release_claim(runner.task_id);
                runner.set_status(TaskStatus::Stopped).await;
            }
            _ => {
                runner.set_status(TaskStatus::Stopping).await;
            }
        }
    }

    /// Scan the queue head for admissible runners and start them.
    fn dispatch_ready(&self) {
        let global_cap = self.config.max_parallel_tasks;

        for runner in self.state.queue_snapshot() {
            if global_cap > 0 && self.state.running_count() >= global_cap {
                break;
            }
            if runner.status().is_finished() {
                self.state.remove_queued(runner.task_id);
                continue;
            }
            if self.project_blocked(&runner) {
                continue;
            }
            if !self.state.try_claim(runner.task_id) {
                continue;
            }

            self.state.remove_queued(runner.task_id);
            self.state.set_running(runner.clone());
            self.spawn_runner(runner);
        }
    }

    /// Per-project admission: the cap counts tasks of the project that
    /// are actually running, so queued tasks cannot block themselves.
    fn project_blocked(&self, runner: &Arc<TaskRunner>) -> bool {
        let cap = runner.project().max_parallel_tasks;
        cap > 0 && self.state.running_count_for_project(runner.project_id) >= cap
    }

    fn spawn_runner(&self, runner: Arc<TaskRunner>) {
        info!(task_id = runner.task_id, "starting task");
        let events = self.events.clone();
        tokio::spawn(async move {
            let driver = runner.clone().run();
            if std::panic::AssertUnwindSafe(driver)
                .catch_unwind()
                .await
                .is_err()
            {
                error!(task_id = runner.task_id, "task runner panicked");
                runner.fail_external("task runner panicked").await;
                let _ = events.send(PoolEvent {
                    kind: PoolEventKind::RunFinished,
                    runner,
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_pool, shell_template};
    use chrono::Utc;

    #[tokio::test]
    async fn test_add_task_registers_all_views() {
        let (pool, _rx, store) = seeded_pool().await;
        let project = store.get_project(1).await.unwrap().unwrap();
        let template = store.get_template(project.id, 2).await.unwrap().unwrap();

        let runner = pool
            .add_task(
                Task::new(project.id, template.id),
                Some("admin".to_string()),
                "",
                project.id,
                true,
            )
            .await
            .unwrap();

        assert_eq!(pool.queue_len(), 1);
        assert_eq!(pool.running_count(), 0);
        assert!(!runner.alias.is_empty(), "needs_alias must assign an alias");
        assert!(pool.get_by_alias(&runner.alias).is_some());

        let stored = store
            .get_task(project.id, runner.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TaskStatus::Waiting);
        assert!(stored.node_id.is_some());
    }

    #[tokio::test]
    async fn test_add_task_rejects_unknown_template() {
        let (pool, _rx, _store) = seeded_pool().await;

        let err = pool
            .add_task(Task::new(1, 999), None, "", 1, false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "missing_dependency");
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_add_task_rejects_unknown_project() {
        let (pool, _rx, store) = seeded_pool().await;
        let _ = store;

        let err = pool
            .add_task(Task::new(77, 2), None, "", 77, false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "missing_dependency");
    }

    #[tokio::test]
    async fn test_stop_task_unknown_id_is_noop() {
        let (pool, _rx, _store) = seeded_pool().await;
        pool.stop_task(12345, false).await.unwrap();
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_stop_waiting_task_terminates_without_start() {
        let (pool, mut rx, store) = seeded_pool().await;

        let runner = pool
            .add_task(Task::new(1, 2), None, "", 1, false)
            .await
            .unwrap();

        pool.stop_task(runner.task_id, false).await.unwrap();

        // Drive the loop by hand and process only the stop event, so
        // the task is still unclaimed when the stop lands.
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.kind, PoolEventKind::Queued);
        let stop = rx.recv().await.unwrap();
        assert_eq!(stop.kind, PoolEventKind::StopRequested);
        pool.handle_event(stop).await;

        assert_eq!(pool.queue_len(), 0);
        assert_eq!(runner.status(), TaskStatus::Stopped);

        let stored = store
            .get_task(1, runner.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TaskStatus::Stopped);

        // Idempotent: a second stop of a finished task is a no-op.
        pool.stop_task(runner.task_id, false).await.unwrap();
        assert_eq!(runner.status(), TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn test_project_cap_blocks_dispatch() {
        let (pool, _rx, store) = seeded_pool().await;

        // A second project with a cap of 1 and a running task.
        let project = store
            .create_project(crate::model::Project {
                id: 0,
                name: "capped".to_string(),
                max_parallel_tasks: 1,
                created: Utc::now(),
            })
            .await;
        let template = store.create_template(shell_template(project.id)).await;

        let running = pool
            .add_task(Task::new(project.id, template.id), None, "", project.id, false)
            .await
            .unwrap();
        pool.state.remove_queued(running.task_id);
        pool.state.set_running(running.clone());

        let waiting = pool
            .add_task(Task::new(project.id, template.id), None, "", project.id, false)
            .await
            .unwrap();

        assert!(pool.project_blocked(&waiting));
        pool.dispatch_ready();
        // Still queued: the cap defers dispatch, nothing claimed it.
        assert_eq!(pool.queue_len(), 1);

        pool.state.clear_running(running.task_id);
        assert!(!pool.project_blocked(&waiting));
    }
}
