// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for unit and integration tests: an in-memory
//! repository, a throwaway runner context and pre-seeded pools.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::hub::Hub;
use crate::model::{AppKind, Project, Task, TaskStatus, Template};
use crate::persistence::MemoryRepository;
use crate::pool::{PoolEvent, TaskPool};
use crate::runner::secrets::NoKeys;
use crate::runner::{RunnerContext, TaskRunner};
use crate::state::MemoryTaskState;

/// A minimal shell template for a project.
pub fn shell_template(project_id: i64) -> Template {
    Template {
        id: 0,
        project_id,
        name: "deploy".to_string(),
        app: AppKind::Shell,
        playbook: "deploy.sh".to_string(),
        arguments: None,
        params: serde_json::Value::Null,
        task_param_schema: None,
        allow_override_args_in_task: false,
        inventory_id: None,
        repository_id: None,
        environment_id: None,
        watchers: vec![],
        vaults: vec![],
    }
}

/// A project with no parallelism cap.
pub fn test_project(id: i64) -> Project {
    Project {
        id,
        name: "Test Project".to_string(),
        max_parallel_tasks: 0,
        created: Utc::now(),
    }
}

/// A runner context over a fresh in-memory store. The event receiver
/// is dropped; runners' pool events go nowhere.
pub async fn test_context() -> (RunnerContext, Arc<MemoryRepository>) {
    let store = Arc::new(MemoryRepository::new());
    let (events, _rx) = mpsc::unbounded_channel::<PoolEvent>();

    let ctx = RunnerContext {
        repo: store.clone(),
        config: Arc::new(Config::default()),
        hub: Hub::start(None),
        keys: Arc::new(NoKeys),
        events,
        node_id: "test-node".to_string(),
    };
    (ctx, store)
}

/// A waiting shell-task runner with fixed ids, over its own context.
pub async fn test_runner(task_id: i64, project_id: i64) -> Arc<TaskRunner> {
    let (ctx, _store) = test_context().await;
    runner_with_context(task_id, project_id, ctx).await
}

/// A waiting shell-task runner over a caller-supplied context.
pub async fn runner_with_context(
    task_id: i64,
    project_id: i64,
    ctx: RunnerContext,
) -> Arc<TaskRunner> {
    let mut task = Task::new(project_id, 1);
    task.id = task_id;
    task.status = TaskStatus::Waiting;

    TaskRunner::new(
        task,
        shell_template(project_id),
        test_project(project_id),
        format!("alias-{}", task_id),
        None,
        ctx,
    )
}

/// A runner whose task carries reference ids that are absent from the
/// store, for missing-dependency paths.
pub async fn runner_with_refs(
    task_id: i64,
    project_id: i64,
    inventory_id: Option<i64>,
    repository_id: Option<i64>,
    environment_id: Option<i64>,
) -> Arc<TaskRunner> {
    let (ctx, _store) = test_context().await;

    let mut task = Task::new(project_id, 1);
    task.id = task_id;
    task.inventory_id = inventory_id;
    task.repository_id = repository_id;
    task.environment_id = environment_id;

    TaskRunner::new(
        task,
        shell_template(project_id),
        test_project(project_id),
        String::new(),
        None,
        ctx,
    )
}

/// A task pool over a seeded memory store: project id 1 with template
/// id 2. Returns the pool, its unconsumed event receiver and the store.
pub async fn seeded_pool() -> (
    TaskPool,
    mpsc::UnboundedReceiver<PoolEvent>,
    Arc<MemoryRepository>,
) {
    let store = Arc::new(MemoryRepository::new());
    let project = store.create_project(test_project(0)).await;
    store.create_template(shell_template(project.id)).await;

    let (pool, rx) = TaskPool::new(
        store.clone(),
        Arc::new(Config::default()),
        Arc::new(MemoryTaskState::new()),
        Hub::start(None),
        Arc::new(NoKeys),
        "test-node".to_string(),
    );
    (pool, rx, store)
}
