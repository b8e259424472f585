// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! The configuration is built once at startup and passed into
//! constructors as `Arc<Config>`; nothing mutates it afterwards.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// How the HOME variable of spawned processes is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeDirMode {
    /// Use the project's temporary directory as HOME.
    #[default]
    ProjectHome,
    /// Use the template's working directory as HOME.
    TemplateDir,
    /// Pass the server process's real HOME through.
    UserHome,
}

/// Per-app binary overrides (`apps.<name>.app_path` / `app_args`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppOverride {
    /// Replacement binary path.
    #[serde(default)]
    pub app_path: Option<String>,
    /// Arguments prepended to every invocation.
    #[serde(default)]
    pub app_args: Vec<String>,
}

/// Taskforge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL. When absent the in-memory store is used.
    pub database_url: Option<String>,
    /// HTTP bind address for webhooks and WebSockets.
    pub bind_addr: SocketAddr,
    /// Global cap on concurrently running tasks, 0 = unlimited.
    pub max_parallel_tasks: usize,
    /// Time zone the cron engine evaluates schedules in.
    pub schedule_timezone: String,
    /// HOME derivation mode for spawned processes.
    pub home_dir_mode: HomeDirMode,
    /// Allow-list of process-env vars passed to children.
    pub forwarded_env_vars: Vec<String>,
    /// Static environment added to every child process.
    pub env_vars: BTreeMap<String, String>,
    /// Per-app binary path/args overrides, keyed by app name.
    pub apps: BTreeMap<String, AppOverride>,
    /// Root for per-task working directories and installed secrets.
    pub tmp_dir: PathBuf,
    /// Interval between node heartbeat rows.
    pub heartbeat_interval: Duration,
    /// Age after which a node heartbeat counts as dead. Must be well
    /// above the heartbeat interval to ride out GC pauses.
    pub orphan_threshold: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_parallel_tasks: 0,
            schedule_timezone: "UTC".to_string(),
            home_dir_mode: HomeDirMode::default(),
            forwarded_env_vars: Vec::new(),
            env_vars: BTreeMap::new(),
            apps: BTreeMap::new(),
            tmp_dir: std::env::temp_dir().join("taskforge"),
            heartbeat_interval: Duration::from_secs(15),
            orphan_threshold: Duration::from_secs(45),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TASKFORGE_DATABASE_URL`: PostgreSQL connection string (in-memory store when unset)
    /// - `TASKFORGE_BIND_ADDR`: HTTP bind address (default: 0.0.0.0:3000)
    /// - `TASKFORGE_MAX_PARALLEL_TASKS`: global task cap, 0 = unlimited
    /// - `TASKFORGE_SCHEDULE_TIMEZONE`: cron time zone (default: UTC)
    /// - `TASKFORGE_HOME_DIR_MODE`: project_home | template_dir | user_home
    /// - `TASKFORGE_FORWARDED_ENV_VARS`: comma-separated allow-list
    /// - `TASKFORGE_ENV_VARS`: JSON object of static child env vars
    /// - `TASKFORGE_APPS`: JSON object `{name: {app_path, app_args}}`
    /// - `TASKFORGE_TMP_DIR`: working directory root
    /// - `TASKFORGE_HEARTBEAT_SECS` / `TASKFORGE_ORPHAN_THRESHOLD_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config {
            database_url: std::env::var("TASKFORGE_DATABASE_URL").ok(),
            ..Config::default()
        };

        if let Ok(addr) = std::env::var("TASKFORGE_BIND_ADDR") {
            config.bind_addr = addr.parse().map_err(|_| {
                ConfigError::Invalid("TASKFORGE_BIND_ADDR", "must be a socket address")
            })?;
        }

        if let Ok(cap) = std::env::var("TASKFORGE_MAX_PARALLEL_TASKS") {
            config.max_parallel_tasks = cap.parse().map_err(|_| {
                ConfigError::Invalid("TASKFORGE_MAX_PARALLEL_TASKS", "must be an integer")
            })?;
        }

        if let Ok(tz) = std::env::var("TASKFORGE_SCHEDULE_TIMEZONE") {
            tz.parse::<chrono_tz::Tz>().map_err(|_| {
                ConfigError::Invalid("TASKFORGE_SCHEDULE_TIMEZONE", "unknown time zone")
            })?;
            config.schedule_timezone = tz;
        }

        if let Ok(mode) = std::env::var("TASKFORGE_HOME_DIR_MODE") {
            config.home_dir_mode = match mode.as_str() {
                "project_home" => HomeDirMode::ProjectHome,
                "template_dir" => HomeDirMode::TemplateDir,
                "user_home" => HomeDirMode::UserHome,
                _ => {
                    return Err(ConfigError::Invalid(
                        "TASKFORGE_HOME_DIR_MODE",
                        "must be project_home, template_dir or user_home",
                    ))
                }
            };
        }

        if let Ok(vars) = std::env::var("TASKFORGE_FORWARDED_ENV_VARS") {
            config.forwarded_env_vars = vars
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(raw) = std::env::var("TASKFORGE_ENV_VARS") {
            config.env_vars = serde_json::from_str(&raw)
                .map_err(|_| ConfigError::Invalid("TASKFORGE_ENV_VARS", "must be a JSON object"))?;
        }

        if let Ok(raw) = std::env::var("TASKFORGE_APPS") {
            config.apps = serde_json::from_str(&raw).map_err(|_| {
                ConfigError::Invalid("TASKFORGE_APPS", "must be a JSON object of app overrides")
            })?;
        }

        if let Ok(dir) = std::env::var("TASKFORGE_TMP_DIR") {
            config.tmp_dir = PathBuf::from(dir);
        }

        if let Ok(secs) = std::env::var("TASKFORGE_HEARTBEAT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                ConfigError::Invalid("TASKFORGE_HEARTBEAT_SECS", "must be an integer")
            })?;
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if let Ok(secs) = std::env::var("TASKFORGE_ORPHAN_THRESHOLD_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                ConfigError::Invalid("TASKFORGE_ORPHAN_THRESHOLD_SECS", "must be an integer")
            })?;
            config.orphan_threshold = Duration::from_secs(secs);
        }

        if config.orphan_threshold < config.heartbeat_interval * 2 {
            return Err(ConfigError::Invalid(
                "TASKFORGE_ORPHAN_THRESHOLD_SECS",
                "must be at least twice the heartbeat interval",
            ));
        }

        Ok(config)
    }

    /// Binary override for an app name, if any.
    pub fn app_override(&self, name: &str) -> Option<&AppOverride> {
        self.apps.get(name)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_parallel_tasks, 0);
        assert_eq!(config.schedule_timezone, "UTC");
        assert_eq!(config.home_dir_mode, HomeDirMode::ProjectHome);
        assert!(config.orphan_threshold >= config.heartbeat_interval * 2);
    }

    #[test]
    fn test_app_override_lookup() {
        let mut config = Config::default();
        config.apps.insert(
            "terraform".to_string(),
            AppOverride {
                app_path: Some("/opt/tofu/bin/tofu".to_string()),
                app_args: vec!["-chdir=.".to_string()],
            },
        );

        let found = config.app_override("terraform").unwrap();
        assert_eq!(found.app_path.as_deref(), Some("/opt/tofu/bin/tofu"));
        assert!(config.app_override("ansible").is_none());
    }

    #[test]
    fn test_app_override_deserializes_from_json() {
        let apps: BTreeMap<String, AppOverride> = serde_json::from_str(
            r#"{"terragrunt": {"app_path": "/usr/local/bin/terragrunt", "app_args": ["--no-color"]}}"#,
        )
        .unwrap();
        assert_eq!(apps["terragrunt"].app_args, vec!["--no-color"]);
    }
}
