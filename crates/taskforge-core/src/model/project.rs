// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Projects and the reference rows a task resolves at run time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tenant. Owns templates, schedules, integrations and tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Per-project cap on concurrently active tasks, 0 = unlimited.
    #[serde(default)]
    pub max_parallel_tasks: usize,
    pub created: DateTime<Utc>,
}

/// Kind of credential stored in an access key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKeyKind {
    #[default]
    None,
    Ssh,
    LoginPassword,
}

/// A credential owned by a project. Secret material arrives here
/// already deserialized by the external secret subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub kind: AccessKeyKind,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Target host definition. For terraform-family apps the inventory
/// name doubles as the workspace name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Inventory content or workspace name; empty means `default`.
    #[serde(default)]
    pub inventory: String,
    #[serde(default)]
    pub ssh_key_id: Option<i64>,
    #[serde(default)]
    pub become_key_id: Option<i64>,
}

/// A git repository templates run from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub git_url: String,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub ssh_key_id: Option<i64>,
}

impl Repository {
    /// Name of the working copy directory for a template.
    pub fn working_dir_name(&self, template_id: i64) -> String {
        format!("repository_{}_{}", self.id, template_id)
    }
}

/// Kind of an environment secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentSecretKind {
    /// Exported into the child's process environment.
    Env,
    /// Passed as an extra variable (`NAME=value` / `-var NAME=value`).
    Var,
}

/// One secret attached to an environment, already deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSecret {
    pub kind: EnvironmentSecretKind,
    pub name: String,
    pub secret: String,
}

/// Variable set a task runs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Extra variables, JSON object as text.
    #[serde(default)]
    pub json: String,
    /// Process environment override, JSON object as text.
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub secrets: Vec<EnvironmentSecret>,
}

/// Liveness record for one cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Audit event row written when a task reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub project_id: Option<i64>,
    pub object_type: String,
    #[serde(default)]
    pub object_id: Option<i64>,
    pub description: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_name() {
        let repo = Repository {
            id: 5,
            project_id: 1,
            name: "infra".into(),
            git_url: "git@example.com:infra.git".into(),
            git_branch: "main".into(),
            ssh_key_id: None,
        };
        assert_eq!(repo.working_dir_name(12), "repository_5_12");
    }
}
