// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL repository backend.
//!
//! Rows are mapped by hand: status/app enums travel as text, JSON
//! params as `jsonb`. Run [`crate::migrations::run_postgres`] before
//! constructing the repository.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};

use crate::error::{CoreError, Result};
use crate::model::{
    AppKind, ArgSet, Environment, EnvironmentSecret, EnvironmentSecretKind, Event, Integration,
    IntegrationAlias, IntegrationExtractValue, IntegrationMatcher, Inventory, NodeHeartbeat,
    Project, Repository as RepositoryRow, Schedule, ScheduleKind, Task, TaskOutputRow, TaskParams,
    TaskStatus, Template, TemplateVault,
};

use super::Repository;

/// PostgreSQL-backed [`Repository`] implementation.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a repository over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_enum<T: FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| CoreError::db("decode", format!("unknown {} value '{}'", what, raw)))
}

fn json_opt<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
    what: &str,
) -> Result<Option<T>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CoreError::db("decode", format!("bad {} JSON: {}", what, e))),
    }
}

fn map_task(row: &PgRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        template_id: row.try_get("template_id")?,
        inventory_id: row.try_get("inventory_id")?,
        environment_id: row.try_get("environment_id")?,
        repository_id: row.try_get("repository_id")?,
        schedule_id: row.try_get("schedule_id")?,
        integration_id: row.try_get("integration_id")?,
        status: parse_enum(&status, "task status")?,
        message: row.try_get("message")?,
        params: row
            .try_get::<Option<serde_json::Value>, _>("params")?
            .unwrap_or(serde_json::Value::Null),
        environment: row.try_get("environment")?,
        arguments: json_opt::<ArgSet>(row.try_get("arguments")?, "task arguments")?,
        commit_hash: row.try_get("commit_hash")?,
        commit_message: row.try_get("commit_message")?,
        created: row.try_get("created")?,
        started: row.try_get("started")?,
        ended: row.try_get("ended")?,
        node_id: row.try_get("node_id")?,
    })
}

fn map_schedule(row: &PgRow) -> Result<Schedule> {
    let kind: String = row.try_get("kind")?;
    Ok(Schedule {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        template_id: row.try_get("template_id")?,
        kind: ScheduleKind::from_db(&kind)
            .ok_or_else(|| CoreError::db("decode", format!("unknown schedule kind '{}'", kind)))?,
        cron_format: row.try_get("cron_format")?,
        run_at: row.try_get("run_at")?,
        active: row.try_get("active")?,
        delete_after_run: row.try_get("delete_after_run")?,
        repository_id: row.try_get("repository_id")?,
        last_commit_hash: row.try_get("last_commit_hash")?,
        task_params: json_opt::<TaskParams>(row.try_get("task_params")?, "schedule task params")?,
    })
}

fn map_template(row: &PgRow) -> Result<Template> {
    let app: String = row.try_get("app")?;
    Ok(Template {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        app: parse_enum::<AppKind>(&app, "template app")?,
        playbook: row.try_get("playbook")?,
        arguments: json_opt::<ArgSet>(row.try_get("arguments")?, "template arguments")?,
        params: row
            .try_get::<Option<serde_json::Value>, _>("params")?
            .unwrap_or(serde_json::Value::Null),
        task_param_schema: row.try_get("task_param_schema")?,
        allow_override_args_in_task: row.try_get("allow_override_args_in_task")?,
        inventory_id: row.try_get("inventory_id")?,
        repository_id: row.try_get("repository_id")?,
        environment_id: row.try_get("environment_id")?,
        watchers: json_opt::<Vec<i64>>(row.try_get("watchers")?, "template watchers")?
            .unwrap_or_default(),
        vaults: Vec::new(),
    })
}

fn map_integration(row: &PgRow) -> Result<Integration> {
    Ok(Integration {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        template_id: row.try_get("template_id")?,
        task_params: json_opt::<TaskParams>(
            row.try_get("task_params")?,
            "integration task params",
        )?,
        auth_secret_id: row.try_get("auth_secret_id")?,
        searchable: row.try_get("searchable")?,
    })
}

fn map_matcher(row: &PgRow) -> Result<IntegrationMatcher> {
    let match_type: String = row.try_get("match_type")?;
    let method: String = row.try_get("method")?;
    let body_data_type: String = row.try_get("body_data_type")?;
    Ok(IntegrationMatcher {
        id: row.try_get("id")?,
        integration_id: row.try_get("integration_id")?,
        name: row.try_get("name")?,
        match_type: serde_str(&match_type, "matcher type")?,
        method: serde_str(&method, "matcher method")?,
        body_data_type: serde_str(&body_data_type, "matcher body data type")?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
    })
}

fn map_extract_value(row: &PgRow) -> Result<IntegrationExtractValue> {
    let value_source: String = row.try_get("value_source")?;
    let body_data_type: String = row.try_get("body_data_type")?;
    let variable_type: String = row.try_get("variable_type")?;
    Ok(IntegrationExtractValue {
        id: row.try_get("id")?,
        integration_id: row.try_get("integration_id")?,
        name: row.try_get("name")?,
        value_source: serde_str(&value_source, "extract value source")?,
        body_data_type: serde_str(&body_data_type, "extract body data type")?,
        key: row.try_get("key")?,
        variable: row.try_get("variable")?,
        variable_type: serde_str(&variable_type, "extract variable type")?,
    })
}

/// Decode an enum stored as its snake_case serde string.
fn serde_str<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| CoreError::db("decode", format!("unknown {} value '{}'", what, raw)))
}

// ============================================================================
// Repository implementation
// ============================================================================

#[async_trait]
impl Repository for PostgresRepository {
    async fn create_task(&self, mut task: Task) -> Result<Task> {
        let row = sqlx::query(
            r#"
            INSERT INTO tasks (
                project_id, template_id, inventory_id, environment_id, repository_id,
                schedule_id, integration_id, status, message, params, environment,
                arguments, created, node_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(task.project_id)
        .bind(task.template_id)
        .bind(task.inventory_id)
        .bind(task.environment_id)
        .bind(task.repository_id)
        .bind(task.schedule_id)
        .bind(task.integration_id)
        .bind(task.status.to_string())
        .bind(&task.message)
        .bind(&task.params)
        .bind(&task.environment)
        .bind(
            task.arguments
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(task.created)
        .bind(&task.node_id)
        .fetch_one(&self.pool)
        .await?;

        task.id = row.try_get("id")?;
        Ok(task)
    }

    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 AND project_id = $2")
            .bind(task_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_task).transpose()
    }

    async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                started = COALESCE($3, started),
                ended = COALESCE($4, ended)
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(status.to_string())
        .bind(started)
        .bind(ended)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_commit(&self, task_id: i64, hash: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET commit_hash = $2, commit_message = $3 WHERE id = $1")
            .bind(task_id)
            .bind(hash)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_node(&self, task_id: i64, node_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET node_id = $2 WHERE id = $1")
            .bind(task_id)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ANY($1) ORDER BY id")
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_task).collect()
    }

    async fn insert_task_output_batch(&self, rows: &[TaskOutputRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder =
            QueryBuilder::new("INSERT INTO task_outputs (task_id, output, time) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.task_id)
                .push_bind(&row.output)
                .push_bind(row.time);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (project_id, object_type, object_id, description, created)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.project_id)
        .bind(&event.object_type)
        .bind(event.object_id)
        .bind(&event.description)
        .bind(event.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Project> {
            let cap: i64 = row.try_get("max_parallel_tasks")?;
            Ok(Project {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                max_parallel_tasks: cap.max(0) as usize,
                created: row.try_get("created")?,
            })
        })
        .transpose()
    }

    async fn get_template(&self, project_id: i64, template_id: i64) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = $1 AND project_id = $2")
            .bind(template_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let mut template = map_template(&row)?;

        let vault_rows =
            sqlx::query("SELECT * FROM template_vaults WHERE template_id = $1 ORDER BY id")
                .bind(template_id)
                .fetch_all(&self.pool)
                .await?;
        for row in &vault_rows {
            template.vaults.push(TemplateVault {
                id: row.try_get("id")?,
                template_id: row.try_get("template_id")?,
                name: row.try_get("name")?,
                vault_key_id: row.try_get("vault_key_id")?,
            });
        }

        Ok(Some(template))
    }

    async fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Option<Inventory>> {
        let row = sqlx::query("SELECT * FROM inventories WHERE id = $1 AND project_id = $2")
            .bind(inventory_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Inventory> {
            Ok(Inventory {
                id: row.try_get("id")?,
                project_id: row.try_get("project_id")?,
                name: row.try_get("name")?,
                inventory: row.try_get("inventory")?,
                ssh_key_id: row.try_get("ssh_key_id")?,
                become_key_id: row.try_get("become_key_id")?,
            })
        })
        .transpose()
    }

    async fn get_repository(
        &self,
        project_id: i64,
        repository_id: i64,
    ) -> Result<Option<RepositoryRow>> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = $1 AND project_id = $2")
            .bind(repository_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<RepositoryRow> {
            Ok(RepositoryRow {
                id: row.try_get("id")?,
                project_id: row.try_get("project_id")?,
                name: row.try_get("name")?,
                git_url: row.try_get("git_url")?,
                git_branch: row.try_get("git_branch")?,
                ssh_key_id: row.try_get("ssh_key_id")?,
            })
        })
        .transpose()
    }

    async fn get_environment(
        &self,
        project_id: i64,
        environment_id: i64,
    ) -> Result<Option<Environment>> {
        let row = sqlx::query("SELECT * FROM environments WHERE id = $1 AND project_id = $2")
            .bind(environment_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let mut environment = Environment {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            json: row.try_get("json")?,
            env: row.try_get("env")?,
            secrets: Vec::new(),
        };

        let secret_rows =
            sqlx::query("SELECT * FROM environment_secrets WHERE environment_id = $1 ORDER BY id")
                .bind(environment_id)
                .fetch_all(&self.pool)
                .await?;
        for row in &secret_rows {
            let kind: String = row.try_get("kind")?;
            environment.secrets.push(EnvironmentSecret {
                kind: serde_str::<EnvironmentSecretKind>(&kind, "environment secret kind")?,
                name: row.try_get("name")?,
                secret: row.try_get("secret")?,
            });
        }

        Ok(Some(environment))
    }

    async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule).collect()
    }

    async fn get_schedule(&self, project_id: i64, schedule_id: i64) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = $1 AND project_id = $2")
            .bind(schedule_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_schedule).transpose()
    }

    async fn set_schedule_active(
        &self,
        project_id: i64,
        schedule_id: i64,
        active: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET active = $3 WHERE id = $1 AND project_id = $2")
            .bind(schedule_id)
            .bind(project_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_schedule(&self, project_id: i64, schedule_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = $1 AND project_id = $2")
            .bind(schedule_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_schedule_commit_hash(
        &self,
        project_id: i64,
        schedule_id: i64,
        hash: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET last_commit_hash = $3 WHERE id = $1 AND project_id = $2")
            .bind(schedule_id)
            .bind(project_id)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_integration_alias(&self, alias: &str) -> Result<Option<IntegrationAlias>> {
        let row = sqlx::query("SELECT * FROM integration_aliases WHERE alias = $1")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<IntegrationAlias> {
            Ok(IntegrationAlias {
                id: row.try_get("id")?,
                project_id: row.try_get("project_id")?,
                integration_id: row.try_get("integration_id")?,
                alias: row.try_get("alias")?,
            })
        })
        .transpose()
    }

    async fn get_integration(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Option<Integration>> {
        let row = sqlx::query("SELECT * FROM integrations WHERE id = $1 AND project_id = $2")
            .bind(integration_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_integration).transpose()
    }

    async fn get_integration_matchers(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationMatcher>> {
        let rows =
            sqlx::query("SELECT * FROM integration_matchers WHERE integration_id = $1 ORDER BY id")
                .bind(integration_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(map_matcher).collect()
    }

    async fn get_integration_extract_values(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExtractValue>> {
        let rows = sqlx::query(
            "SELECT * FROM integration_extract_values WHERE integration_id = $1 ORDER BY id",
        )
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_extract_value).collect()
    }

    async fn get_option(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM options WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("value").map_err(CoreError::from))
            .transpose()
    }

    async fn set_option(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO options (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_node_heartbeat(&self, node_id: &str, seen: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_heartbeats (node_id, last_seen) VALUES ($1, $2)
            ON CONFLICT (node_id) DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(node_id)
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_node_heartbeats(&self) -> Result<Vec<NodeHeartbeat>> {
        let rows = sqlx::query("SELECT node_id, last_seen FROM node_heartbeats ORDER BY node_id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<NodeHeartbeat> {
                Ok(NodeHeartbeat {
                    node_id: row.try_get("node_id")?,
                    last_seen: row.try_get("last_seen")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyDataType, MatchMethod};

    #[test]
    fn test_serde_str_decodes_snake_case() {
        let method: MatchMethod = serde_str("begins_with", "matcher method").unwrap();
        assert_eq!(method, MatchMethod::BeginsWith);
        let body: BodyDataType = serde_str("string", "body data type").unwrap();
        assert_eq!(body, BodyDataType::String);
    }

    #[test]
    fn test_serde_str_rejects_unknown() {
        let result: Result<MatchMethod> = serde_str("sounds_like", "matcher method");
        assert!(result.is_err());
    }
}
