// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child process command construction.
//!
//! Builds the program, argument list and environment for an app
//! invocation: binary overrides from configuration, the forwarded-env
//! allow-list, static env vars, and the HOME derivation mode.

use std::path::{Path, PathBuf};

use crate::config::{Config, HomeDirMode};
use crate::model::AppKind;

/// A fully composed child invocation, ready to spawn.
#[derive(Debug, Clone)]
pub struct AppCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl AppCommand {
    /// Single line used for log streams, `$ program arg1 arg2 ...`.
    pub fn display_line(&self) -> String {
        let mut line = format!("$ {}", self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Compose a command for an app kind.
///
/// `home` is the directory exported as HOME; `extra_env` is appended
/// last and wins over everything else.
pub fn build(
    app: AppKind,
    config: &Config,
    mut args: Vec<String>,
    cwd: &Path,
    home: &Path,
    extra_env: Vec<(String, String)>,
) -> AppCommand {
    let name = app.to_string();
    let mut program = app.default_binary().to_string();

    if let Some(overrides) = config.app_override(&name) {
        if let Some(path) = &overrides.app_path {
            program = path.clone();
        }
        if !overrides.app_args.is_empty() {
            let mut prefixed = overrides.app_args.clone();
            prefixed.append(&mut args);
            args = prefixed;
        }
    }

    // Terragrunt shells out to terraform; pin the tf path unless the
    // arguments already carry one.
    if app == AppKind::Terragrunt
        && !args
            .iter()
            .any(|a| a == "--tf-path" || a.starts_with("--tf-path="))
    {
        args.push("--tf-path=terraform".to_string());
    }

    let mut env = base_env(config);
    env.push(("HOME".to_string(), home.display().to_string()));
    env.push(("PWD".to_string(), cwd.display().to_string()));
    env.extend(extra_env);

    AppCommand {
        program,
        args,
        env,
        cwd: cwd.to_path_buf(),
    }
}

/// Environment passed to every child: PATH, the configured allow-list
/// of forwarded process vars, and the static var map.
pub fn base_env(config: &Config) -> Vec<(String, String)> {
    let mut env = Vec::new();

    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".to_string(), path));
    }

    for name in &config.forwarded_env_vars {
        if let Ok(value) = std::env::var(name) {
            env.push((name.clone(), value));
        }
    }

    for (name, value) in &config.env_vars {
        env.push((name.clone(), value.clone()));
    }

    env
}

/// Resolve the HOME directory for a child per the configured mode.
pub fn home_dir(config: &Config, project_dir: &Path, template_dir: &Path) -> PathBuf {
    match config.home_dir_mode {
        HomeDirMode::ProjectHome => project_dir.to_path_buf(),
        HomeDirMode::TemplateDir => template_dir.to_path_buf(),
        HomeDirMode::UserHome => std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_dir.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppOverride;

    #[test]
    fn test_build_uses_default_binary() {
        let config = Config::default();
        let cmd = build(
            AppKind::Ansible,
            &config,
            vec!["site.yml".to_string()],
            Path::new("/work"),
            Path::new("/home/x"),
            vec![],
        );
        assert_eq!(cmd.program, "ansible-playbook");
        assert_eq!(cmd.args, vec!["site.yml"]);
        assert!(cmd
            .env
            .iter()
            .any(|(k, v)| k == "HOME" && v == "/home/x"));
    }

    #[test]
    fn test_build_applies_overrides() {
        let mut config = Config::default();
        config.apps.insert(
            "terraform".to_string(),
            AppOverride {
                app_path: Some("/opt/tofu".to_string()),
                app_args: vec!["-chdir=.".to_string()],
            },
        );

        let cmd = build(
            AppKind::Terraform,
            &config,
            vec!["plan".to_string()],
            Path::new("/work"),
            Path::new("/home/x"),
            vec![],
        );
        assert_eq!(cmd.program, "/opt/tofu");
        assert_eq!(cmd.args, vec!["-chdir=.", "plan"]);
    }

    #[test]
    fn test_terragrunt_gets_tf_path() {
        let config = Config::default();
        let cmd = build(
            AppKind::Terragrunt,
            &config,
            vec!["plan".to_string()],
            Path::new("/work"),
            Path::new("/home/x"),
            vec![],
        );
        assert!(cmd.args.contains(&"--tf-path=terraform".to_string()));

        let cmd = build(
            AppKind::Terragrunt,
            &config,
            vec!["plan".to_string(), "--tf-path=/usr/bin/tofu".to_string()],
            Path::new("/work"),
            Path::new("/home/x"),
            vec![],
        );
        assert_eq!(
            cmd.args
                .iter()
                .filter(|a| a.starts_with("--tf-path"))
                .count(),
            1
        );
    }

    #[test]
    fn test_static_env_vars_are_added() {
        let mut config = Config::default();
        config
            .env_vars
            .insert("ANSIBLE_FORCE_COLOR".to_string(), "1".to_string());

        let env = base_env(&config);
        assert!(env
            .iter()
            .any(|(k, v)| k == "ANSIBLE_FORCE_COLOR" && v == "1"));
    }

    #[test]
    fn test_home_dir_modes() {
        let mut config = Config::default();
        let project = Path::new("/tmp/project_1");
        let template = Path::new("/tmp/project_1/repo");

        assert_eq!(home_dir(&config, project, template), project);

        config.home_dir_mode = HomeDirMode::TemplateDir;
        assert_eq!(home_dir(&config, project, template), template);
    }

    #[test]
    fn test_display_line() {
        let cmd = AppCommand {
            program: "terraform".to_string(),
            args: vec!["plan".to_string(), "-lock=false".to_string()],
            env: vec![],
            cwd: PathBuf::from("/work"),
        };
        assert_eq!(cmd.display_line(), "$ terraform plan -lock=false");
    }
}
