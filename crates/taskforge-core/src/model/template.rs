// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Templates, app kinds and the CLI argument grammar.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of job a template runs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppKind {
    Ansible,
    Terraform,
    Terragrunt,
    Shell,
    Bash,
    Python,
    Powershell,
}

impl AppKind {
    /// Terraform-family apps reference in-flight tasks by alias
    /// (plan→apply chaining), so the pool must register one.
    pub fn needs_alias(self) -> bool {
        matches!(self, Self::Terraform | Self::Terragrunt)
    }

    /// True for apps that run the plan/apply confirmation flow.
    pub fn is_terraform_family(self) -> bool {
        matches!(self, Self::Terraform | Self::Terragrunt)
    }

    /// Binary invoked when no `apps.<name>.app_path` override exists.
    pub fn default_binary(self) -> &'static str {
        match self {
            Self::Ansible => "ansible-playbook",
            Self::Terraform => "terraform",
            Self::Terragrunt => "terragrunt",
            Self::Shell => "sh",
            Self::Bash => "bash",
            Self::Python => "python3",
            Self::Powershell => "pwsh",
        }
    }
}

/// Template or task CLI arguments.
///
/// Either a plain ordered sequence (interpreted as the `default` stage)
/// or a mapping from stage name (`init`, `plan`, `apply`, `default`;
/// unknown names pass through) to a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSet {
    Args(Vec<String>),
    Stages(BTreeMap<String, Vec<String>>),
}

impl ArgSet {
    /// Parse from a JSON string. Empty input yields an empty arg list.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::Args(Vec::new()));
        }
        serde_json::from_str(raw)
    }

    /// Normalize to a stage map; a plain sequence becomes the
    /// `default` stage.
    pub fn stage_map(&self) -> BTreeMap<String, Vec<String>> {
        match self {
            Self::Args(args) => {
                let mut map = BTreeMap::new();
                if !args.is_empty() {
                    map.insert("default".to_string(), args.clone());
                }
                map
            }
            Self::Stages(map) => map.clone(),
        }
    }

    /// Arguments of the `default` stage, used by single-stage apps.
    pub fn default_args(&self) -> Vec<String> {
        match self {
            Self::Args(args) => args.clone(),
            Self::Stages(map) => map.get("default").cloned().unwrap_or_default(),
        }
    }
}

/// Vault password reference attached to a template, keyed by vault name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVault {
    pub id: i64,
    pub template_id: i64,
    /// None is the unnamed default vault.
    #[serde(default)]
    pub name: Option<String>,
    pub vault_key_id: i64,
}

/// A runnable job definition owned by a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub app: AppKind,
    /// Playbook path, script path or terraform working directory,
    /// relative to the repository root.
    pub playbook: String,
    #[serde(default)]
    pub arguments: Option<ArgSet>,
    /// App-specific template params (e.g. [`TerraformTemplateParams`]).
    #[serde(default)]
    pub params: serde_json::Value,
    /// Survey-variable schema presented to users on run; opaque here.
    #[serde(default)]
    pub task_param_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub allow_override_args_in_task: bool,
    #[serde(default)]
    pub inventory_id: Option<i64>,
    #[serde(default)]
    pub repository_id: Option<i64>,
    #[serde(default)]
    pub environment_id: Option<i64>,
    /// Users receiving live updates for this template's tasks.
    #[serde(default)]
    pub watchers: Vec<i64>,
    #[serde(default)]
    pub vaults: Vec<TemplateVault>,
}

impl Template {
    /// Terraform template params from the opaque blob; `null` yields defaults.
    pub fn terraform_params(&self) -> Result<TerraformTemplateParams, serde_json::Error> {
        if self.params.is_null() {
            return Ok(TerraformTemplateParams::default());
        }
        serde_json::from_value(self.params.clone())
    }
}

/// Per-task terraform knobs carried in the task's param blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerraformTaskParams {
    #[serde(default)]
    pub destroy: bool,
    /// Stop after plan; never apply.
    #[serde(default)]
    pub plan: bool,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default)]
    pub reconfigure: bool,
}

/// Terraform knobs fixed at the template level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerraformTemplateParams {
    #[serde(default)]
    pub auto_approve: bool,
    /// Allows the task-level auto_approve flag to take effect.
    #[serde(default)]
    pub allow_auto_approve: bool,
    #[serde(default)]
    pub override_backend: bool,
    #[serde(default)]
    pub backend_filename: Option<String>,
}
