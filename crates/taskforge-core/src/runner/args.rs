// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLI argument composition for the supported app kinds.
//!
//! Single-stage apps (shell, ansible, scripts) get one flat argument
//! vector; terraform-family apps get a per-stage map merged from the
//! template's and the task's argument grammars.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::model::{
    ArgSet, Environment, EnvironmentSecret, EnvironmentSecretKind, TerraformTaskParams,
};

/// Extra-vars key reserved for runner metadata; never forwarded to
/// child processes as a variable.
pub const INTERNAL_VARS_KEY: &str = "taskforge_vars";

/// Merge the environment's extra-vars JSON with the task-level
/// override. Task entries win.
pub fn collect_extra_vars(
    environment: Option<&Environment>,
    task_override: Option<&str>,
) -> Result<BTreeMap<String, Value>> {
    let mut vars: BTreeMap<String, Value> = BTreeMap::new();

    if let Some(environment) = environment {
        if !environment.json.trim().is_empty() {
            let parsed: BTreeMap<String, Value> =
                serde_json::from_str(&environment.json).map_err(|e| CoreError::Config {
                    what: "environment".to_string(),
                    details: e.to_string(),
                })?;
            vars.extend(parsed);
        }
    }

    if let Some(raw) = task_override {
        if !raw.trim().is_empty() {
            let parsed: BTreeMap<String, Value> =
                serde_json::from_str(raw).map_err(|e| CoreError::Config {
                    what: "task environment".to_string(),
                    details: e.to_string(),
                })?;
            vars.extend(parsed);
        }
    }

    Ok(vars)
}

/// Plain string form of an extra var for `K=V` style flags.
fn fmt_var(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Arguments for single-stage apps, in fixed order: playbook/script,
/// environment secret `VAR=` pairs, template args, extra vars as
/// `K=V` (internal metadata excluded), task args.
pub fn single_stage_args(
    playbook: &str,
    secrets: &[EnvironmentSecret],
    template_args: &[String],
    extra_vars: &BTreeMap<String, Value>,
    task_args: &[String],
) -> Vec<String> {
    let mut args = Vec::new();
    args.push(playbook.to_string());

    for secret in secrets {
        if secret.kind == EnvironmentSecretKind::Var {
            args.push(format!("{}={}", secret.name, secret.secret));
        }
    }

    args.extend_from_slice(template_args);

    for (name, value) in extra_vars {
        if name != INTERNAL_VARS_KEY {
            args.push(format!("{}={}", name, fmt_var(value)));
        }
    }

    args.extend_from_slice(task_args);
    args
}

/// Per-stage argument maps for terraform-family apps.
///
/// Template args are merged first, task args appended per stage; an
/// empty result collapses to a single `default` stage. Every stage
/// except `init` is then prefixed with `-destroy` when requested and
/// suffixed with `-var K=V` pairs for extra vars and `var`-type
/// environment secrets.
pub fn terraform_stage_args(
    template_args: Option<&ArgSet>,
    task_args: Option<&ArgSet>,
    params: &TerraformTaskParams,
    extra_vars: &BTreeMap<String, Value>,
    secrets: &[EnvironmentSecret],
) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if let Some(template_args) = template_args {
        for (stage, args) in template_args.stage_map() {
            map.insert(stage, args);
        }
    }

    if let Some(task_args) = task_args {
        for (stage, args) in task_args.stage_map() {
            map.entry(stage).or_default().extend(args);
        }
    }

    if map.is_empty() {
        map.insert("default".to_string(), Vec::new());
    }

    let mut var_args = Vec::new();
    for (name, value) in extra_vars {
        if name == INTERNAL_VARS_KEY {
            continue;
        }
        var_args.push("-var".to_string());
        var_args.push(format!("{}={}", name, fmt_var(value)));
    }
    for secret in secrets {
        if secret.kind != EnvironmentSecretKind::Var {
            continue;
        }
        var_args.push("-var".to_string());
        var_args.push(format!("{}={}", secret.name, secret.secret));
    }

    for (stage, stage_args) in map.iter_mut() {
        if stage == "init" {
            continue;
        }
        let mut combined = Vec::new();
        if params.destroy {
            combined.push("-destroy".to_string());
        }
        combined.append(stage_args);
        combined.extend(var_args.iter().cloned());
        *stage_args = combined;
    }

    map
}

/// Arguments for one terraform stage: the stage-specific entry when
/// present, otherwise `default`.
pub fn resolve_stage(map: &BTreeMap<String, Vec<String>>, stage: &str) -> Vec<String> {
    map.get(stage)
        .or_else(|| map.get("default"))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> Vec<EnvironmentSecret> {
        vec![
            EnvironmentSecret {
                kind: EnvironmentSecretKind::Var,
                name: "DB_PASSWORD".to_string(),
                secret: "hunter2".to_string(),
            },
            EnvironmentSecret {
                kind: EnvironmentSecretKind::Env,
                name: "AWS_SECRET".to_string(),
                secret: "not-a-var".to_string(),
            },
        ]
    }

    #[test]
    fn test_collect_extra_vars_task_wins() {
        let environment = Environment {
            id: 1,
            project_id: 1,
            name: "prod".to_string(),
            json: r#"{"region":"eu-west-1","debug":false}"#.to_string(),
            env: None,
            secrets: vec![],
        };

        let vars =
            collect_extra_vars(Some(&environment), Some(r#"{"debug":true}"#)).unwrap();
        assert_eq!(vars["region"], Value::String("eu-west-1".to_string()));
        assert_eq!(vars["debug"], Value::Bool(true));
    }

    #[test]
    fn test_collect_extra_vars_invalid_json() {
        let err = collect_extra_vars(None, Some("{oops")).unwrap_err();
        assert_eq!(err.reason(), "config_error");
    }

    #[test]
    fn test_single_stage_arg_order() {
        let mut extra_vars = BTreeMap::new();
        extra_vars.insert("region".to_string(), Value::String("us-east-1".to_string()));
        extra_vars.insert(
            INTERNAL_VARS_KEY.to_string(),
            serde_json::json!({"task_id": 1}),
        );

        let args = single_stage_args(
            "deploy.sh",
            &secrets(),
            &["--verbose".to_string()],
            &extra_vars,
            &["--dry-run".to_string()],
        );

        assert_eq!(
            args,
            vec![
                "deploy.sh",
                "DB_PASSWORD=hunter2",
                "--verbose",
                "region=us-east-1",
                "--dry-run",
            ]
        );
    }

    #[test]
    fn test_terraform_stage_merge_template_first() {
        let template_args = ArgSet::parse(r#"{"plan": ["-t1"], "init": ["-i1"]}"#).unwrap();
        let task_args = ArgSet::parse(r#"{"plan": ["-t2"]}"#).unwrap();

        let map = terraform_stage_args(
            Some(&template_args),
            Some(&task_args),
            &TerraformTaskParams::default(),
            &BTreeMap::new(),
            &[],
        );

        assert_eq!(map["plan"], vec!["-t1", "-t2"]);
        // init stages carry no common args.
        assert_eq!(map["init"], vec!["-i1"]);
    }

    #[test]
    fn test_terraform_destroy_and_vars() {
        let mut extra_vars = BTreeMap::new();
        extra_vars.insert("env".to_string(), Value::String("staging".to_string()));

        let params = TerraformTaskParams {
            destroy: true,
            ..TerraformTaskParams::default()
        };

        let map = terraform_stage_args(None, None, &params, &extra_vars, &secrets());
        assert_eq!(
            map["default"],
            vec![
                "-destroy",
                "-var",
                "env=staging",
                "-var",
                "DB_PASSWORD=hunter2",
            ]
        );
    }

    #[test]
    fn test_terraform_plain_sequences_become_default_stage() {
        let template_args = ArgSet::parse(r#"["-compact-warnings"]"#).unwrap();
        let task_args = ArgSet::parse(r#"["-no-color"]"#).unwrap();

        let map = terraform_stage_args(
            Some(&template_args),
            Some(&task_args),
            &TerraformTaskParams::default(),
            &BTreeMap::new(),
            &[],
        );

        assert_eq!(map["default"], vec!["-compact-warnings", "-no-color"]);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_resolve_stage_falls_back_to_default() {
        let mut map = BTreeMap::new();
        map.insert("default".to_string(), vec!["-d".to_string()]);
        map.insert("apply".to_string(), vec!["-a".to_string()]);

        assert_eq!(resolve_stage(&map, "apply"), vec!["-a"]);
        assert_eq!(resolve_stage(&map, "plan"), vec!["-d"]);
        assert!(resolve_stage(&BTreeMap::new(), "plan").is_empty());
    }
}
