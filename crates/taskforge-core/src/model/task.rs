// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task rows and their lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::template::ArgSet;

/// Lifecycle status of a task.
///
/// Transitions are serialized per task: only the runner that currently
/// owns the task mutates its status. `success`, `fail` and `stopped`
/// are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted and queued, not yet claimed.
    Waiting,
    /// Claimed by a runner, preparing to execute.
    Starting,
    /// Child process running.
    Running,
    /// Blocked on a plan confirmation from the outside.
    WaitingConfirmation,
    /// Confirmation granted; apply proceeds.
    Confirmed,
    /// Confirmation denied; the task terminates as failed.
    Rejected,
    /// Terminal: finished successfully.
    Success,
    /// Terminal: finished with an error.
    Fail,
    /// Terminal: killed on request.
    Stopped,
    /// Stop requested, awaiting process shutdown.
    Stopping,
}

impl TaskStatus {
    /// True for terminal statuses. No log lines are forwarded for a
    /// task after it reaches one of these.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Stopped)
    }

    /// True while a stop request still makes sense.
    pub fn is_stoppable(self) -> bool {
        !self.is_finished() && self != Self::Stopping
    }
}

/// One persisted execution record for a template run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub template_id: i64,
    #[serde(default)]
    pub inventory_id: Option<i64>,
    #[serde(default)]
    pub environment_id: Option<i64>,
    #[serde(default)]
    pub repository_id: Option<i64>,
    #[serde(default)]
    pub schedule_id: Option<i64>,
    #[serde(default)]
    pub integration_id: Option<i64>,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
    /// Opaque parameter blob interpreted per app kind.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Task-level environment override, JSON object as text.
    #[serde(default)]
    pub environment: Option<String>,
    /// Task-level CLI arguments, merged after the template's.
    #[serde(default)]
    pub arguments: Option<ArgSet>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended: Option<DateTime<Utc>>,
    /// Node that owns the task while it is in flight.
    #[serde(default)]
    pub node_id: Option<String>,
}

impl Task {
    /// A fresh waiting task for the given template.
    pub fn new(project_id: i64, template_id: i64) -> Self {
        Self {
            id: 0,
            project_id,
            template_id,
            inventory_id: None,
            environment_id: None,
            repository_id: None,
            schedule_id: None,
            integration_id: None,
            status: TaskStatus::Waiting,
            message: String::new(),
            params: serde_json::Value::Null,
            environment: None,
            arguments: None,
            commit_hash: None,
            commit_message: None,
            created: Utc::now(),
            started: None,
            ended: None,
            node_id: None,
        }
    }

    /// App-specific params deserialized from the opaque blob.
    /// `null` yields the type's defaults.
    pub fn extract_params<T: serde::de::DeserializeOwned + Default>(
        &self,
    ) -> Result<T, serde_json::Error> {
        if self.params.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.params.clone())
    }
}

/// Seed form of a task, used by schedules and integrations to
/// materialize tasks with preset overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default)]
    pub message: Option<String>,
    /// Environment override, JSON object as text.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub arguments: Option<ArgSet>,
}

impl TaskParams {
    /// Materialize a task carrying these overrides.
    pub fn to_task(&self, project_id: i64, template_id: i64) -> Task {
        let mut task = Task::new(project_id, template_id);
        if let Some(message) = &self.message {
            task.message = message.clone();
        }
        task.environment = self.environment.clone();
        if let Some(params) = &self.params {
            task.params = params.clone();
        }
        task.arguments = self.arguments.clone();
        task
    }
}

/// One line of task output destined for the batched insert stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputRow {
    pub task_id: i64,
    pub output: String,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::WaitingConfirmation,
            TaskStatus::Success,
            TaskStatus::Stopping,
        ] {
            let s = status.to_string();
            assert_eq!(TaskStatus::from_str(&s).unwrap(), status);
        }
        assert_eq!(TaskStatus::WaitingConfirmation.to_string(), "waiting_confirmation");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Success.is_finished());
        assert!(TaskStatus::Fail.is_finished());
        assert!(TaskStatus::Stopped.is_finished());
        assert!(!TaskStatus::Running.is_finished());
        assert!(!TaskStatus::Stopping.is_finished());
        assert!(!TaskStatus::Stopping.is_stoppable());
        assert!(TaskStatus::WaitingConfirmation.is_stoppable());
    }

    #[test]
    fn test_task_params_to_task() {
        let params = TaskParams {
            message: Some("nightly run".to_string()),
            environment: Some(r#"{"STAGE":"prod"}"#.to_string()),
            params: Some(serde_json::json!({"destroy": false})),
            arguments: None,
        };

        let task = params.to_task(3, 14);
        assert_eq!(task.project_id, 3);
        assert_eq!(task.template_id, 14);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.message, "nightly run");
        assert_eq!(task.environment.as_deref(), Some(r#"{"STAGE":"prod"}"#));
    }

    #[test]
    fn test_extract_params_defaults_on_null() {
        use crate::model::TerraformTaskParams;

        let task = Task::new(1, 1);
        let params: TerraformTaskParams = task.extract_params().unwrap();
        assert!(!params.destroy);
        assert!(!params.auto_approve);
    }
}
