// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory repository backend.
//!
//! The single-node default when no database is configured, and the
//! store every integration test runs against. All maps live behind one
//! `RwLock`; ids are assigned from a shared sequence.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Environment, Event, Integration, IntegrationAlias, IntegrationExtractValue,
    IntegrationMatcher, Inventory, NodeHeartbeat, Project, Repository as RepositoryRow, Schedule,
    Task, TaskOutputRow, TaskStatus, Template,
};

use super::Repository;

#[derive(Default)]
struct Inner {
    seq: i64,
    projects: HashMap<i64, Project>,
    templates: HashMap<i64, Template>,
    inventories: HashMap<i64, Inventory>,
    repositories: HashMap<i64, RepositoryRow>,
    environments: HashMap<i64, Environment>,
    schedules: HashMap<i64, Schedule>,
    integrations: HashMap<i64, Integration>,
    matchers: Vec<IntegrationMatcher>,
    extract_values: Vec<IntegrationExtractValue>,
    aliases: Vec<IntegrationAlias>,
    tasks: HashMap<i64, Task>,
    outputs: Vec<TaskOutputRow>,
    events: Vec<Event>,
    options: HashMap<String, String>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }
}

/// In-memory [`Repository`] implementation.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Seeding helpers, used by boot wiring and tests
    // ------------------------------------------------------------------

    /// Insert a project, assigning an id.
    pub async fn create_project(&self, mut project: Project) -> Project {
        let mut inner = self.inner.write().await;
        project.id = inner.next_id();
        inner.projects.insert(project.id, project.clone());
        project
    }

    /// Insert a template, assigning an id.
    pub async fn create_template(&self, mut template: Template) -> Template {
        let mut inner = self.inner.write().await;
        template.id = inner.next_id();
        inner.templates.insert(template.id, template.clone());
        template
    }

    /// Insert an inventory, assigning an id.
    pub async fn create_inventory(&self, mut inventory: Inventory) -> Inventory {
        let mut inner = self.inner.write().await;
        inventory.id = inner.next_id();
        inner.inventories.insert(inventory.id, inventory.clone());
        inventory
    }

    /// Insert a repository, assigning an id.
    pub async fn create_repository(&self, mut repository: RepositoryRow) -> RepositoryRow {
        let mut inner = self.inner.write().await;
        repository.id = inner.next_id();
        inner.repositories.insert(repository.id, repository.clone());
        repository
    }

    /// Insert an environment, assigning an id.
    pub async fn create_environment(&self, mut environment: Environment) -> Environment {
        let mut inner = self.inner.write().await;
        environment.id = inner.next_id();
        inner.environments.insert(environment.id, environment.clone());
        environment
    }

    /// Insert a schedule, assigning an id.
    pub async fn create_schedule(&self, mut schedule: Schedule) -> Schedule {
        let mut inner = self.inner.write().await;
        schedule.id = inner.next_id();
        inner.schedules.insert(schedule.id, schedule.clone());
        schedule
    }

    /// Insert an integration, assigning an id.
    pub async fn create_integration(&self, mut integration: Integration) -> Integration {
        let mut inner = self.inner.write().await;
        integration.id = inner.next_id();
        inner.integrations.insert(integration.id, integration.clone());
        integration
    }

    /// Attach a matcher to an integration.
    pub async fn create_integration_matcher(
        &self,
        mut matcher: IntegrationMatcher,
    ) -> IntegrationMatcher {
        let mut inner = self.inner.write().await;
        matcher.id = inner.next_id();
        inner.matchers.push(matcher.clone());
        matcher
    }

    /// Attach an extract value to an integration.
    pub async fn create_integration_extract_value(
        &self,
        mut value: IntegrationExtractValue,
    ) -> IntegrationExtractValue {
        let mut inner = self.inner.write().await;
        value.id = inner.next_id();
        inner.extract_values.push(value.clone());
        value
    }

    /// Register a webhook alias for an integration.
    pub async fn create_integration_alias(&self, mut alias: IntegrationAlias) -> IntegrationAlias {
        let mut inner = self.inner.write().await;
        alias.id = inner.next_id();
        inner.aliases.push(alias.clone());
        alias
    }

    // ------------------------------------------------------------------
    // Inspection helpers for tests
    // ------------------------------------------------------------------

    /// All tasks currently stored, in id order.
    pub async fn all_tasks(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Output rows recorded so far.
    pub async fn output_len(&self) -> usize {
        self.inner.read().await.outputs.len()
    }

    /// Audit events recorded so far.
    pub async fn events(&self) -> Vec<Event> {
        self.inner.read().await.events.clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_task(&self, mut task: Task) -> Result<Task> {
        let mut inner = self.inner.write().await;
        task.id = inner.next_id();
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .get(&task_id)
            .filter(|t| t.project_id == project_id)
            .cloned())
    }

    async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.status = status;
            if started.is_some() {
                task.started = started;
            }
            if ended.is_some() {
                task.ended = ended;
            }
        }
        Ok(())
    }

    async fn set_task_commit(&self, task_id: i64, hash: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.commit_hash = Some(hash.to_string());
            task.commit_message = Some(message.to_string());
        }
        Ok(())
    }

    async fn set_task_node(&self, task_id: i64, node_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.node_id = Some(node_id.to_string());
        }
        Ok(())
    }

    async fn list_tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn insert_task_output_batch(&self, rows: &[TaskOutputRow]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.outputs.extend_from_slice(rows);
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.events.push(event);
        Ok(())
    }

    async fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        Ok(self.inner.read().await.projects.get(&project_id).cloned())
    }

    async fn get_template(&self, project_id: i64, template_id: i64) -> Result<Option<Template>> {
        let inner = self.inner.read().await;
        Ok(inner
            .templates
            .get(&template_id)
            .filter(|t| t.project_id == project_id)
            .cloned())
    }

    async fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Option<Inventory>> {
        let inner = self.inner.read().await;
        Ok(inner
            .inventories
            .get(&inventory_id)
            .filter(|i| i.project_id == project_id)
            .cloned())
    }

    async fn get_repository(
        &self,
        project_id: i64,
        repository_id: i64,
    ) -> Result<Option<RepositoryRow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .repositories
            .get(&repository_id)
            .filter(|r| r.project_id == project_id)
            .cloned())
    }

    async fn get_environment(
        &self,
        project_id: i64,
        environment_id: i64,
    ) -> Result<Option<Environment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .environments
            .get(&environment_id)
            .filter(|e| e.project_id == project_id)
            .cloned())
    }

    async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        let inner = self.inner.read().await;
        let mut schedules: Vec<Schedule> = inner.schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn get_schedule(&self, project_id: i64, schedule_id: i64) -> Result<Option<Schedule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .schedules
            .get(&schedule_id)
            .filter(|s| s.project_id == project_id)
            .cloned())
    }

    async fn set_schedule_active(
        &self,
        project_id: i64,
        schedule_id: i64,
        active: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(schedule) = inner
            .schedules
            .get_mut(&schedule_id)
            .filter(|s| s.project_id == project_id)
        {
            schedule.active = active;
        }
        Ok(())
    }

    async fn delete_schedule(&self, project_id: i64, schedule_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let matches = inner
            .schedules
            .get(&schedule_id)
            .is_some_and(|s| s.project_id == project_id);
        if matches {
            inner.schedules.remove(&schedule_id);
        }
        Ok(())
    }

    async fn set_schedule_commit_hash(
        &self,
        project_id: i64,
        schedule_id: i64,
        hash: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(schedule) = inner
            .schedules
            .get_mut(&schedule_id)
            .filter(|s| s.project_id == project_id)
        {
            schedule.last_commit_hash = Some(hash.to_string());
        }
        Ok(())
    }

    async fn find_integration_alias(&self, alias: &str) -> Result<Option<IntegrationAlias>> {
        let inner = self.inner.read().await;
        Ok(inner.aliases.iter().find(|a| a.alias == alias).cloned())
    }

    async fn get_integration(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Option<Integration>> {
        let inner = self.inner.read().await;
        Ok(inner
            .integrations
            .get(&integration_id)
            .filter(|i| i.project_id == project_id)
            .cloned())
    }

    async fn get_integration_matchers(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationMatcher>> {
        let inner = self.inner.read().await;
        Ok(inner
            .matchers
            .iter()
            .filter(|m| m.integration_id == integration_id)
            .cloned()
            .collect())
    }

    async fn get_integration_extract_values(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExtractValue>> {
        let inner = self.inner.read().await;
        Ok(inner
            .extract_values
            .iter()
            .filter(|v| v.integration_id == integration_id)
            .cloned()
            .collect())
    }

    async fn get_option(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.options.get(key).cloned())
    }

    async fn set_option(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.options.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn upsert_node_heartbeat(&self, node_id: &str, seen: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.heartbeats.insert(node_id.to_string(), seen);
        Ok(())
    }

    async fn list_node_heartbeats(&self) -> Result<Vec<NodeHeartbeat>> {
        let inner = self.inner.read().await;
        let mut heartbeats: Vec<NodeHeartbeat> = inner
            .heartbeats
            .iter()
            .map(|(node_id, last_seen)| NodeHeartbeat {
                node_id: node_id.clone(),
                last_seen: *last_seen,
            })
            .collect();
        heartbeats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppKind;

    fn project() -> Project {
        Project {
            id: 0,
            name: "Test Project".to_string(),
            max_parallel_tasks: 0,
            created: Utc::now(),
        }
    }

    fn template(project_id: i64) -> Template {
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

    #[tokio::test]
    async fn test_task_crud() {
        let store = MemoryRepository::new();
        let project = store.create_project(project()).await;
        let template = store.create_template(template(project.id)).await;

        let task = store
            .create_task(Task::new(project.id, template.id))
            .await
            .unwrap();
        assert!(task.id > 0);

        store
            .update_task_status(task.id, TaskStatus::Running, Some(Utc::now()), None)
            .await
            .unwrap();

        let stored = store.get_task(project.id, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert!(stored.started.is_some());
        assert!(stored.ended.is_none());

        // Wrong project does not leak tasks.
        assert!(store.get_task(project.id + 99, task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_tasks_with_status() {
        let store = MemoryRepository::new();
        let project = store.create_project(project()).await;
        let template = store.create_template(template(project.id)).await;

        let a = store
            .create_task(Task::new(project.id, template.id))
            .await
            .unwrap();
        let b = store
            .create_task(Task::new(project.id, template.id))
            .await
            .unwrap();
        store
            .update_task_status(a.id, TaskStatus::Running, None, None)
            .await
            .unwrap();
        store
            .update_task_status(b.id, TaskStatus::Success, None, None)
            .await
            .unwrap();

        let running = store
            .list_tasks_with_status(&[TaskStatus::Running, TaskStatus::Starting])
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let store = MemoryRepository::new();
        let project = store.create_project(project()).await;
        let template = store.create_template(template(project.id)).await;

        let schedule = store
            .create_schedule(Schedule {
                id: 0,
                project_id: project.id,
                template_id: template.id,
                kind: crate::model::ScheduleKind::Cron,
                cron_format: "* * * * *".to_string(),
                run_at: None,
                active: true,
                delete_after_run: false,
                repository_id: None,
                last_commit_hash: None,
                task_params: None,
            })
            .await;

        store
            .set_schedule_active(project.id, schedule.id, false)
            .await
            .unwrap();
        let stored = store
            .get_schedule(project.id, schedule.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.active);

        store.delete_schedule(project.id, schedule.id).await.unwrap();
        assert!(store
            .get_schedule(project.id, schedule.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_options_and_heartbeats() {
        let store = MemoryRepository::new();
        store.set_option("retention_days", "30").await.unwrap();
        assert_eq!(
            store.get_option("retention_days").await.unwrap().as_deref(),
            Some("30")
        );
        assert!(store.get_option("missing").await.unwrap().is_none());

        let now = Utc::now();
        store.upsert_node_heartbeat("node-a", now).await.unwrap();
        store.upsert_node_heartbeat("node-a", now).await.unwrap();
        let beats = store.list_node_heartbeats().await.unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].node_id, "node-a");
    }
}
