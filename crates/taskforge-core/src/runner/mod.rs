// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task state machine.
//!
//! Each task is driven by exactly one [`TaskRunner`], owned by one
//! spawned task:
//!
//! ```text
//! waiting → starting → {running | waiting_confirmation}
//!                          │              │ confirm / reject
//!                          ▼              ▼
//!                       running ──→ {success | fail | stopped}
//! ```
//!
//! Status transitions are serialized through [`TaskRunner::set_status`]
//! and fan out three ways: the persisted row, the status watch channel
//! (the confirm/reject rendezvous), and the live-update hub. Log lines
//! go to the batched output writer, registered log listeners and the
//! template's watcher users, and never after a terminal status.

pub mod apps;
pub mod args;
pub mod git;
mod job;
pub mod requirements;
pub mod secrets;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::hub::Hub;
use crate::model::{Event, Project, Task, TaskOutputRow, TaskStatus, Template};
use crate::persistence::Repository;
use crate::pool::{PoolEvent, PoolEventKind};

use self::secrets::KeyStore;

/// Maximum rows per output batch insert.
const MAX_OUTPUT_BATCH: usize = 1000;

/// How long buffered output may sit before a flush.
const OUTPUT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Listener invoked for every log line of a task.
pub type LogListener = Box<dyn Fn(DateTime<Utc>, &str) + Send + Sync>;

/// Dependencies shared by every runner a pool creates.
#[derive(Clone)]
pub struct RunnerContext {
    pub repo: Arc<dyn Repository>,
    pub config: Arc<Config>,
    pub hub: Hub,
    pub keys: Arc<dyn KeyStore>,
    pub events: mpsc::UnboundedSender<PoolEvent>,
    pub node_id: String,
}

/// The in-memory state machine driving one task.
pub struct TaskRunner {
    /// Task id, fixed at admission.
    pub task_id: i64,
    /// Owning project id, fixed at admission.
    pub project_id: i64,
    /// Alias registered for in-flight cross-references; empty when the
    /// app does not need one.
    pub alias: String,
    /// User who pressed run, if any.
    pub username: Option<String>,

    template: Template,
    project: Project,
    ctx: RunnerContext,

    task: RwLock<Task>,
    status_tx: watch::Sender<TaskStatus>,
    killed: AtomicBool,
    process_group: Mutex<Option<i32>>,

    output_tx: Mutex<Option<mpsc::UnboundedSender<TaskOutputRow>>>,
    output_writer: Mutex<Option<JoinHandle<()>>>,
    log_listeners: Mutex<Vec<LogListener>>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("task_id", &self.task_id)
            .field("project_id", &self.project_id)
            .field("alias", &self.alias)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Build a runner for a persisted task. The task row must already
    /// carry its assigned id.
    pub fn new(
        task: Task,
        template: Template,
        project: Project,
        alias: String,
        username: Option<String>,
        ctx: RunnerContext,
    ) -> Arc<Self> {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_output(ctx.repo.clone(), output_rx));
        let (status_tx, _) = watch::channel(task.status);

        Arc::new(Self {
            task_id: task.id,
            project_id: task.project_id,
            alias,
            username,
            template,
            project,
            ctx,
            task: RwLock::new(task),
            status_tx,
            killed: AtomicBool::new(false),
            process_group: Mutex::new(None),
            output_tx: Mutex::new(Some(output_tx)),
            output_writer: Mutex::new(Some(writer)),
            log_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the task row.
    pub fn task(&self) -> Task {
        self.task.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The template this task runs.
    pub fn template(&self) -> &Template {
        &self.template
    }

    /// The owning project.
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status transitions. Used for the confirm/reject
    /// rendezvous and the terraform stdin responder.
    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Register a log listener. Listeners see lines in write order.
    pub fn add_log_listener(&self, listener: LogListener) {
        self.log_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// True once a stop was requested.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Request a stop. Idempotent: the flag latches and repeated kill
    /// signals to a dead process group are harmless no-ops.
    pub fn kill(&self, force: bool) {
        self.killed.store(true, Ordering::SeqCst);

        let pgid = *self
            .process_group
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(pgid) = pgid {
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                warn!(task_id = self.task_id, pgid, error = %e, "failed to signal process group");
            }
        }
    }

    fn set_process_group(&self, pgid: Option<i32>) {
        *self
            .process_group
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = pgid;
    }

    /// Record one log line: batched repository stream, registered
    /// listeners, then the watchers' sockets. Dropped silently once
    /// the task is terminal.
    pub fn log(&self, message: &str) {
        if self.status().is_finished() {
            return;
        }

        let now = Utc::now();

        if let Some(tx) = self
            .output_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = tx.send(TaskOutputRow {
                task_id: self.task_id,
                output: message.to_string(),
                time: now,
            });
        }

        for listener in self
            .log_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            listener(now, message);
        }

        let payload = serde_json::json!({
            "type": "log",
            "task_id": self.task_id,
            "template_id": self.template.id,
            "project_id": self.project_id,
            "output": message,
            "time": now,
        });
        self.fan_out(&payload);
    }

    /// Transition the task's status. Ignores no-op transitions and
    /// anything after a terminal status. Persists the row, signals the
    /// status channel and notifies watchers.
    pub async fn set_status(&self, status: TaskStatus) {
        let update = {
            let mut task = self.task.write().unwrap_or_else(|e| e.into_inner());
            if task.status == status || task.status.is_finished() {
                None
            } else {
                task.status = status;
                let mut started = None;
                let mut ended = None;
                if status == TaskStatus::Starting {
                    task.started = Some(Utc::now());
                    started = task.started;
                }
                if status.is_finished() {
                    task.ended = Some(Utc::now());
                    ended = task.ended;
                }
                Some((started, ended))
            }
        };

        let Some((started, ended)) = update else {
            return;
        };

        if let Err(e) = self
            .ctx
            .repo
            .update_task_status(self.task_id, status, started, ended)
            .await
        {
            error!(task_id = self.task_id, error = %e, "failed to persist task status");
        }

        let _ = self.status_tx.send_replace(status);
        self.send_status_update();
    }

    /// Push the current row state to the template's watchers.
    fn send_status_update(&self) {
        let task = self.task();
        let payload = serde_json::json!({
            "type": "update",
            "task_id": task.id,
            "template_id": task.template_id,
            "project_id": task.project_id,
            "status": task.status,
            "start": task.started,
            "end": task.ended,
        });
        self.fan_out(&payload);
    }

    fn fan_out(&self, payload: &serde_json::Value) {
        let Ok(bytes) = serde_json::to_vec(payload) else {
            return;
        };
        for user in &self.template.watchers {
            self.ctx.hub.message(*user, &bytes);
        }
    }

    /// Block until the confirmation is resolved: returns on confirmed,
    /// rejected or any terminal status.
    pub(crate) async fn wait_confirmation(&self) -> TaskStatus {
        let mut rx = self.subscribe_status();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_finished()
                || status == TaskStatus::Confirmed
                || status == TaskStatus::Rejected
            {
                return status;
            }
            if rx.changed().await.is_err() {
                return status;
            }
        }
    }

    /// Drive the task to completion. Spawned by the pool's queue loop;
    /// exactly one invocation per claimed task.
    pub async fn run(self: Arc<Self>) {
        self.set_status(TaskStatus::Starting).await;
        self.log("Task started");

        let outcome = if self.is_killed() {
            Err(CoreError::Internal {
                details: "task stopped before execution".to_string(),
            })
        } else {
            self.execute_job().await
        };

        let (status, reason) = match &outcome {
            Ok(()) => {
                // The plan-only path may already have finished the task.
                if self.status().is_finished() {
                    (self.status(), None)
                } else if self.is_killed() {
                    (TaskStatus::Stopped, None)
                } else {
                    (TaskStatus::Success, None)
                }
            }
            Err(_) if self.is_killed() => (TaskStatus::Stopped, None),
            Err(e) => {
                self.log(&format!("Task failed: {}", e));
                (TaskStatus::Fail, Some(e.reason()))
            }
        };

        self.set_status(status).await;
        self.finalize(reason).await;

        let _ = self.ctx.events.send(PoolEvent {
            kind: PoolEventKind::RunFinished,
            runner: self.clone(),
        });
    }

    /// Terminal bookkeeping: audit event row and output stream flush.
    async fn finalize(&self, reason: Option<&'static str>) {
        let status = self.status();
        info!(
            task_id = self.task_id,
            template = %self.template.name,
            status = %status,
            "task finished"
        );

        let description = match reason {
            Some(reason) => format!(
                "Task {} ({}) finished - {} ({})",
                self.task_id,
                self.template.name,
                status.to_string().to_uppercase(),
                reason
            ),
            None => format!(
                "Task {} ({}) finished - {}",
                self.task_id,
                self.template.name,
                status.to_string().to_uppercase()
            ),
        };

        if let Err(e) = self
            .ctx
            .repo
            .create_event(Event {
                project_id: Some(self.project_id),
                object_type: "task".to_string(),
                object_id: Some(self.task_id),
                description,
                created: Utc::now(),
            })
            .await
        {
            error!(task_id = self.task_id, error = %e, "failed to create task event");
        }

        // Closing the channel flushes the writer's remaining buffer.
        self.output_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let writer = self
            .output_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    /// Mark the task failed from outside the runner's own task (used
    /// by the pool when a runner panics).
    pub async fn fail_external(&self, reason: &str) {
        self.log(&format!("Task failed: {}", reason));
        self.set_status(TaskStatus::Fail).await;
        self.finalize(Some("internal")).await;
    }
}

/// Output writer loop: batches rows and inserts them in chunks of at
/// most [`MAX_OUTPUT_BATCH`], flushing on an interval otherwise.
async fn write_output(
    repo: Arc<dyn Repository>,
    mut rx: mpsc::UnboundedReceiver<TaskOutputRow>,
) {
    let mut buffer: Vec<TaskOutputRow> = Vec::new();

    loop {
        tokio::select! {
            row = rx.recv() => match row {
                Some(row) => {
                    buffer.push(row);
                    if buffer.len() >= MAX_OUTPUT_BATCH {
                        flush_output(&*repo, &mut buffer).await;
                    }
                }
                None => {
                    flush_output(&*repo, &mut buffer).await;
                    break;
                }
            },
            _ = tokio::time::sleep(OUTPUT_FLUSH_INTERVAL), if !buffer.is_empty() => {
                flush_output(&*repo, &mut buffer).await;
            }
        }
    }
}

async fn flush_output(repo: &dyn Repository, buffer: &mut Vec<TaskOutputRow>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = repo.insert_task_output_batch(buffer).await {
        error!(error = %e, "failed to insert task output batch");
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, test_runner};

    #[tokio::test]
    async fn test_status_transitions_reach_watch_channel() {
        let runner = test_runner(1, 1).await;
        let mut rx = runner.subscribe_status();

        runner.set_status(TaskStatus::Starting).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TaskStatus::Starting);
        assert_eq!(runner.status(), TaskStatus::Starting);
        assert!(runner.task().started.is_some());
    }

    #[tokio::test]
    async fn test_no_transition_out_of_terminal() {
        let runner = test_runner(1, 1).await;
        runner.set_status(TaskStatus::Fail).await;
        assert!(runner.task().ended.is_some());

        runner.set_status(TaskStatus::Running).await;
        assert_eq!(runner.status(), TaskStatus::Fail);
    }

    #[tokio::test]
    async fn test_no_logs_after_terminal_status() {
        let (ctx, store) = test_context().await;
        let runner = crate::test_support::runner_with_context(5, 1, ctx).await;

        runner.log("before");
        runner.set_status(TaskStatus::Stopped).await;
        runner.log("after");
        runner.finalize(None).await;

        assert_eq!(store.output_len().await, 1);
    }

    #[tokio::test]
    async fn test_log_listeners_see_lines_in_order() {
        let runner = test_runner(1, 1).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runner.add_log_listener(Box::new(move |_, line| {
            sink.lock().unwrap().push(line.to_string());
        }));

        runner.log("one");
        runner.log("two");
        runner.log("three");

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["one", "two", "three"]
        );
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let runner = test_runner(1, 1).await;
        runner.kill(false);
        assert!(runner.is_killed());
        runner.kill(true);
        runner.kill(true);
        assert!(runner.is_killed());
    }

    #[tokio::test]
    async fn test_wait_confirmation_returns_on_confirm() {
        let runner = test_runner(1, 1).await;
        runner.set_status(TaskStatus::WaitingConfirmation).await;

        let waiter = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.wait_confirmation().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.set_status(TaskStatus::Confirmed).await;

        let resolved = waiter.await.unwrap();
        assert_eq!(resolved, TaskStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_finalize_writes_event_row() {
        let (ctx, store) = test_context().await;
        let runner = crate::test_support::runner_with_context(9, 2, ctx).await;

        runner.set_status(TaskStatus::Success).await;
        runner.finalize(None).await;

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].description.contains("SUCCESS"));
        assert_eq!(events[0].object_id, Some(runner.task_id));
    }
}
