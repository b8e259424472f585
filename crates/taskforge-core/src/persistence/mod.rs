// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for taskforge-core.
//!
//! The execution plane talks to storage exclusively through the
//! [`Repository`] trait. Two backends ship with the crate: a Postgres
//! implementation for production and an in-memory implementation that
//! doubles as the single-node default and the test store.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryRepository;
pub use self::postgres::PostgresRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Environment, Event, Integration, IntegrationAlias, IntegrationExtractValue,
    IntegrationMatcher, Inventory, NodeHeartbeat, Project, Repository as RepositoryRow, Schedule,
    Task, TaskOutputRow, TaskStatus, Template,
};

/// Storage interface used by the execution plane.
#[allow(missing_docs)]
#[async_trait]
pub trait Repository: Send + Sync {
    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Persist a new task row and return it with its assigned id.
    async fn create_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<Option<Task>>;

    /// Update status and, when provided, start/end timestamps.
    async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_task_commit(&self, task_id: i64, hash: &str, message: &str) -> Result<()>;

    async fn set_task_node(&self, task_id: i64, node_id: &str) -> Result<()>;

    /// Tasks currently in any of the given statuses, across projects.
    async fn list_tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    /// Batched output insertion; callers keep batches at or below 1000 rows.
    async fn insert_task_output_batch(&self, rows: &[TaskOutputRow]) -> Result<()>;

    async fn create_event(&self, event: Event) -> Result<()>;

    // ------------------------------------------------------------------
    // Reference rows
    // ------------------------------------------------------------------

    async fn get_project(&self, project_id: i64) -> Result<Option<Project>>;

    async fn get_template(&self, project_id: i64, template_id: i64) -> Result<Option<Template>>;

    async fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Option<Inventory>>;

    async fn get_repository(
        &self,
        project_id: i64,
        repository_id: i64,
    ) -> Result<Option<RepositoryRow>>;

    async fn get_environment(
        &self,
        project_id: i64,
        environment_id: i64,
    ) -> Result<Option<Environment>>;

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    async fn get_schedules(&self) -> Result<Vec<Schedule>>;

    async fn get_schedule(&self, project_id: i64, schedule_id: i64) -> Result<Option<Schedule>>;

    async fn set_schedule_active(
        &self,
        project_id: i64,
        schedule_id: i64,
        active: bool,
    ) -> Result<()>;

    async fn delete_schedule(&self, project_id: i64, schedule_id: i64) -> Result<()>;

    async fn set_schedule_commit_hash(
        &self,
        project_id: i64,
        schedule_id: i64,
        hash: &str,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Integrations
    // ------------------------------------------------------------------

    async fn find_integration_alias(&self, alias: &str) -> Result<Option<IntegrationAlias>>;

    async fn get_integration(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Option<Integration>>;

    async fn get_integration_matchers(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationMatcher>>;

    async fn get_integration_extract_values(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExtractValue>>;

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    async fn get_option(&self, key: &str) -> Result<Option<String>>;

    async fn set_option(&self, key: &str, value: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------

    async fn upsert_node_heartbeat(&self, node_id: &str, seen: DateTime<Utc>) -> Result<()>;

    async fn list_node_heartbeats(&self) -> Result<Vec<NodeHeartbeat>>;
}
