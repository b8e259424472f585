// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job phases: populate details, install secrets, prepare the
//! repository, install requirements, execute.
//!
//! Every phase is individually failable and maps to one reason in the
//! error taxonomy. Scoped resources (secret files, the per-task
//! scratch directory, the terraform backend override) are guards that
//! release on every exit path. The killed flag is re-checked between
//! phases so a stop arriving mid-preparation still takes effect.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::{
    AppKind, Environment, Inventory, Repository as RepositoryRow, TaskStatus,
    TerraformTaskParams, TerraformTemplateParams,
};

use super::apps::{self, AppCommand};
use super::args;
use super::git::GitContext;
use super::requirements::{self, GalaxyRequirementKind};
use super::secrets::{self, KeyInstallation};
use super::TaskRunner;

/// Resolved references and working locations for one run.
#[derive(Debug)]
struct JobDetails {
    inventory: Option<Inventory>,
    repository: Option<RepositoryRow>,
    environment: Option<Environment>,
    extra_vars: BTreeMap<String, serde_json::Value>,
    project_dir: PathBuf,
    work_dir: PathBuf,
    playbook_dir: PathBuf,
}

/// Installed credentials for one run. Dropping the struct releases
/// every file-backed secret.
struct JobSecrets {
    repo_key: Option<KeyInstallation>,
    ssh_key: Option<KeyInstallation>,
    become_key: Option<KeyInstallation>,
    vaults: BTreeMap<String, KeyInstallation>,
}

/// Removes the terraform backend override file on drop.
struct BackendOverrideGuard {
    path: PathBuf,
}

impl Drop for BackendOverrideGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "unable to remove backend override file");
            }
        }
    }
}

fn stopped_err() -> CoreError {
    CoreError::Internal {
        details: "task stopped".to_string(),
    }
}

impl TaskRunner {
    /// Run all phases for this task.
    pub(crate) async fn execute_job(&self) -> Result<()> {
        let details = self.populate_details().await?;

        std::fs::create_dir_all(&details.project_dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("task_{}_", self.task_id))
            .tempdir_in(&details.project_dir)
            .map_err(|e| CoreError::Internal {
                details: e.to_string(),
            })?;

        let job_secrets = self.install_secrets(&details, scratch.path()).await?;
        if self.is_killed() {
            return Err(stopped_err());
        }

        self.prepare_repository(&details, &job_secrets).await?;
        if self.is_killed() {
            return Err(stopped_err());
        }

        let _backend_guard = self.install_requirements(&details, &job_secrets).await?;
        if self.is_killed() {
            return Err(stopped_err());
        }

        self.run_app(&details, &job_secrets).await
    }

    // ------------------------------------------------------------------
    // Phase 1: populate details
    // ------------------------------------------------------------------

    async fn populate_details(&self) -> Result<JobDetails> {
        let task = self.task();
        let template = &self.template;

        let inventory = match task.inventory_id.or(template.inventory_id) {
            Some(id) => Some(
                self.ctx
                    .repo
                    .get_inventory(self.project_id, id)
                    .await?
                    .ok_or(CoreError::MissingDependency {
                        kind: "inventory",
                        id,
                    })?,
            ),
            None => None,
        };

        let repository = match task.repository_id.or(template.repository_id) {
            Some(id) => Some(
                self.ctx
                    .repo
                    .get_repository(self.project_id, id)
                    .await?
                    .ok_or(CoreError::MissingDependency {
                        kind: "repository",
                        id,
                    })?,
            ),
            None => None,
        };

        let environment = match task.environment_id.or(template.environment_id) {
            Some(id) => Some(
                self.ctx
                    .repo
                    .get_environment(self.project_id, id)
                    .await?
                    .ok_or(CoreError::MissingDependency {
                        kind: "environment",
                        id,
                    })?,
            ),
            None => None,
        };

        let mut extra_vars =
            args::collect_extra_vars(environment.as_ref(), task.environment.as_deref())?;
        // Runner metadata travels with the extra vars but is excluded
        // from the composed CLI arguments.
        extra_vars.insert(
            args::INTERNAL_VARS_KEY.to_string(),
            serde_json::json!({
                "task_id": self.task_id,
                "username": self.username,
                "schedule_id": task.schedule_id,
            }),
        );

        let project_dir = self
            .ctx
            .config
            .tmp_dir
            .join(format!("project_{}", self.project_id));
        let work_dir = match &repository {
            Some(repository) => project_dir.join(repository.working_dir_name(template.id)),
            None => project_dir.clone(),
        };

        let playbook_rel = template.playbook.trim_start_matches('/');
        let playbook_dir = if playbook_rel.is_empty() {
            work_dir.clone()
        } else if template.app.is_terraform_family() {
            // For terraform the playbook names the working directory.
            work_dir.join(playbook_rel)
        } else {
            work_dir
                .join(playbook_rel)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| work_dir.clone())
        };

        Ok(JobDetails {
            inventory,
            repository,
            environment,
            extra_vars,
            project_dir,
            work_dir,
            playbook_dir,
        })
    }

    // ------------------------------------------------------------------
    // Phase 2: install secrets
    // ------------------------------------------------------------------

    async fn install_secrets(&self, details: &JobDetails, dir: &Path) -> Result<JobSecrets> {
        let keys = &*self.ctx.keys;

        let install = |key_id: Option<i64>| async move {
            match key_id {
                None => Ok::<_, CoreError>(None),
                Some(key_id) => {
                    let key = keys
                        .get_access_key(self.project_id, key_id)
                        .await?
                        .ok_or_else(|| CoreError::Secret {
                            reason: format!("access key {} not found", key_id),
                        })?;
                    Ok(Some(secrets::install_key(&key, dir)?))
                }
            }
        };

        let repo_key = install(details.repository.as_ref().and_then(|r| r.ssh_key_id)).await?;
        let ssh_key = install(details.inventory.as_ref().and_then(|i| i.ssh_key_id)).await?;
        let become_key = install(details.inventory.as_ref().and_then(|i| i.become_key_id)).await?;

        let vaults = secrets::install_vault_passwords(keys, &self.template, dir).await?;

        Ok(JobSecrets {
            repo_key,
            ssh_key,
            become_key,
            vaults,
        })
    }

    // ------------------------------------------------------------------
    // Phase 3: prepare repository
    // ------------------------------------------------------------------

    async fn prepare_repository(
        &self,
        details: &JobDetails,
        job_secrets: &JobSecrets,
    ) -> Result<()> {
        let Some(repository) = &details.repository else {
            return Ok(());
        };

        self.log("Preparing repository...");
        let git = GitContext {
            repository,
            dir: details.work_dir.clone(),
            ssh_key: job_secrets.repo_key.as_ref(),
        };
        git.ensure_working_copy().await?;

        let requested_commit = self.task().commit_hash;
        if let Some(commit) = requested_commit {
            self.log(&format!("Checking out commit {}...", commit));
            git.checkout(&commit).await?;
        }

        let (hash, subject) = git.head_commit().await?;
        {
            let mut task = self.task.write().unwrap_or_else(|e| e.into_inner());
            task.commit_hash = Some(hash.clone());
            task.commit_message = Some(subject.clone());
        }
        self.ctx
            .repo
            .set_task_commit(self.task_id, &hash, &subject)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 4: install requirements
    // ------------------------------------------------------------------

    async fn install_requirements(
        &self,
        details: &JobDetails,
        job_secrets: &JobSecrets,
    ) -> Result<Option<BackendOverrideGuard>> {
        match self.template.app {
            AppKind::Ansible => {
                self.install_galaxy_requirements(details).await?;
                Ok(None)
            }
            AppKind::Terraform | AppKind::Terragrunt => {
                self.install_terraform_requirements(details, job_secrets).await
            }
            _ => Ok(None),
        }
    }

    async fn install_galaxy_requirements(&self, details: &JobDetails) -> Result<()> {
        for kind in [GalaxyRequirementKind::Role, GalaxyRequirementKind::Collection] {
            for candidate in
                requirements::candidate_files(kind, &details.playbook_dir, &details.work_dir)
            {
                if !candidate.is_file() {
                    continue;
                }

                let sidecar = requirements::hash_sidecar(&candidate, kind);
                if !requirements::requirements_changed(&candidate, &sidecar) {
                    self.log(&format!(
                        "{} has no changes. Skip galaxy install process.",
                        candidate.display()
                    ));
                    continue;
                }

                let cmd = AppCommand {
                    program: "ansible-galaxy".to_string(),
                    args: requirements::galaxy_install_args(kind, &candidate),
                    env: apps::base_env(&self.ctx.config),
                    cwd: details.playbook_dir.clone(),
                };
                let status = self.run_command(&cmd, false).await?;
                if !status.success() {
                    return Err(CoreError::Requirements {
                        reason: format!("galaxy install failed for {}", candidate.display()),
                    });
                }
                requirements::write_requirements_hash(&candidate, &sidecar)?;
            }
        }
        Ok(())
    }

    async fn install_terraform_requirements(
        &self,
        details: &JobDetails,
        job_secrets: &JobSecrets,
    ) -> Result<Option<BackendOverrideGuard>> {
        let task = self.task();
        let template_params = self.template_terraform_params()?;
        let task_params: TerraformTaskParams =
            task.extract_params().map_err(|e| CoreError::Config {
                what: "task params".to_string(),
                details: e.to_string(),
            })?;

        let mut guard = None;
        if template_params.override_backend {
            let filename = template_params
                .backend_filename
                .clone()
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| "backend.tf".to_string());
            let path = details.playbook_dir.join(filename);
            std::fs::write(&path, "terraform {\n  backend \"http\" {\n  }\n}\n").map_err(
                |e| CoreError::Requirements {
                    reason: format!("writing backend override: {}", e),
                },
            )?;
            guard = Some(BackendOverrideGuard { path });
        }

        let stages = self.terraform_stages(details)?;
        let mut init_args = vec!["init".to_string(), "-lock=false".to_string()];
        if task_params.upgrade {
            init_args.push("-upgrade".to_string());
        }
        if task_params.reconfigure {
            init_args.push("-reconfigure".to_string());
        } else {
            init_args.push("-migrate-state".to_string());
        }
        init_args.extend(stages.get("init").cloned().unwrap_or_default());

        let mut env = self.child_env(details)?;
        if let Some(key) = &job_secrets.repo_key {
            // Module sources may be fetched over git during init.
            env.extend(key.git_env());
        }

        let cmd = self.app_command(details, init_args, env.clone());
        // Init can prompt for state migration; the stdin responder
        // answers it from the confirm/reject status.
        let status = self.run_command(&cmd, true).await?;
        if !status.success() {
            return Err(CoreError::Requirements {
                reason: format!("init exited with {:?}", status.code()),
            });
        }

        // Workspace selection, skipped when the backend has no
        // workspace support.
        if self.workspaces_supported(details, &env).await {
            let workspace = details
                .inventory
                .as_ref()
                .map(|i| i.inventory.trim())
                .filter(|w| !w.is_empty())
                .unwrap_or("default")
                .to_string();

            let mut select_args = vec![
                "workspace".to_string(),
                "select".to_string(),
                "-or-create=true".to_string(),
                workspace,
            ];
            if self.template.app == AppKind::Terragrunt {
                let mut prefixed = vec!["run".to_string(), "--".to_string()];
                prefixed.append(&mut select_args);
                select_args = prefixed;
            }

            let cmd = self.app_command(details, select_args, env);
            let status = self.run_command(&cmd, false).await?;
            if !status.success() {
                return Err(CoreError::Requirements {
                    reason: format!("workspace select exited with {:?}", status.code()),
                });
            }
        }

        Ok(guard)
    }

    async fn workspaces_supported(&self, details: &JobDetails, env: &[(String, String)]) -> bool {
        let cmd = self.app_command(
            details,
            vec!["workspace".to_string(), "list".to_string()],
            env.to_vec(),
        );

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .env_clear()
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        matches!(command.status().await, Ok(status) if status.success())
    }

    // ------------------------------------------------------------------
    // Phase 5/6: execute
    // ------------------------------------------------------------------

    async fn run_app(&self, details: &JobDetails, job_secrets: &JobSecrets) -> Result<()> {
        match self.template.app {
            AppKind::Terraform | AppKind::Terragrunt => {
                self.run_terraform(details, job_secrets).await
            }
            _ => self.run_single_stage(details, job_secrets).await,
        }
    }

    async fn run_single_stage(&self, details: &JobDetails, job_secrets: &JobSecrets) -> Result<()> {
        let task = self.task();

        let template_args = self
            .template
            .arguments
            .as_ref()
            .map(|a| a.default_args())
            .unwrap_or_default();
        let task_args = match &task.arguments {
            Some(arguments) if self.template.allow_override_args_in_task => {
                arguments.default_args()
            }
            Some(_) => {
                self.log("Task CLI arguments are not allowed for this template, ignoring");
                Vec::new()
            }
            None => Vec::new(),
        };

        let env_secrets = details
            .environment
            .as_ref()
            .map(|e| e.secrets.as_slice())
            .unwrap_or_default();

        let mut cli = args::single_stage_args(
            &self.template.playbook,
            env_secrets,
            &template_args,
            &details.extra_vars,
            &task_args,
        );
        if self.template.app == AppKind::Ansible {
            if let Some(path) = job_secrets.ssh_key.as_ref().and_then(|k| k.path()) {
                cli.push(format!("--private-key={}", path.display()));
            }
            if let Some(path) = job_secrets.become_key.as_ref().and_then(|k| k.path()) {
                cli.push("--become".to_string());
                cli.push(format!("--become-password-file={}", path.display()));
            }
            cli.extend(secrets::vault_args(&job_secrets.vaults));
        }

        let env = self.child_env(details)?;
        let cmd = apps::build(
            self.template.app,
            &self.ctx.config,
            cli,
            &details.work_dir,
            &apps::home_dir(&self.ctx.config, &details.project_dir, &details.work_dir),
            env,
        );

        self.set_status(TaskStatus::Running).await;
        let status = self.run_command(&cmd, false).await?;
        if !status.success() {
            return Err(CoreError::Run {
                code: status.code(),
            });
        }
        Ok(())
    }

    async fn run_terraform(&self, details: &JobDetails, job_secrets: &JobSecrets) -> Result<()> {
        let task = self.task();
        let template_params = self.template_terraform_params()?;
        let task_params: TerraformTaskParams =
            task.extract_params().map_err(|e| CoreError::Config {
                what: "task params".to_string(),
                details: e.to_string(),
            })?;

        let stages = self.terraform_stages(details)?;
        let mut env = self.child_env(details)?;
        if let Some(key) = &job_secrets.repo_key {
            env.extend(key.git_env());
        }

        // Plan.
        let plan_no_changes = Arc::new(AtomicBool::new(false));
        {
            let flag = plan_no_changes.clone();
            self.add_log_listener(Box::new(move |_, line| {
                if line.contains("No changes.") {
                    flag.store(true, Ordering::SeqCst);
                }
            }));
        }

        let mut plan_args = vec!["plan".to_string(), "-lock=false".to_string()];
        plan_args.extend(args::resolve_stage(&stages, "plan"));
        let cmd = self.app_command(details, plan_args, env.clone());

        self.set_status(TaskStatus::Running).await;
        let status = self.run_command(&cmd, false).await?;
        if !status.success() {
            return Err(CoreError::Run {
                code: status.code(),
            });
        }

        // Plan-only runs and empty plans finish here.
        if plan_no_changes.load(Ordering::SeqCst) || task_params.plan {
            self.set_status(TaskStatus::Success).await;
            return Ok(());
        }

        let auto_approve = template_params.auto_approve
            || (template_params.allow_auto_approve && task_params.auto_approve);
        if !auto_approve {
            self.set_status(TaskStatus::WaitingConfirmation).await;
            match self.wait_confirmation().await {
                TaskStatus::Rejected => return Err(CoreError::Rejected),
                TaskStatus::Confirmed => {}
                _ => return Err(stopped_err()),
            }
        }

        // Apply.
        self.set_status(TaskStatus::Running).await;
        let mut apply_args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-lock=false".to_string(),
        ];
        apply_args.extend(args::resolve_stage(&stages, "apply"));
        let cmd = self.app_command(details, apply_args, env);

        let status = self.run_command(&cmd, false).await?;
        if !status.success() {
            return Err(CoreError::Run {
                code: status.code(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn template_terraform_params(&self) -> Result<TerraformTemplateParams> {
        self.template
            .terraform_params()
            .map_err(|e| CoreError::Config {
                what: "template params".to_string(),
                details: e.to_string(),
            })
    }

    fn terraform_stages(
        &self,
        details: &JobDetails,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let task = self.task();
        let task_params: TerraformTaskParams =
            task.extract_params().map_err(|e| CoreError::Config {
                what: "task params".to_string(),
                details: e.to_string(),
            })?;

        let env_secrets = details
            .environment
            .as_ref()
            .map(|e| e.secrets.as_slice())
            .unwrap_or_default();

        let task_arguments = if self.template.allow_override_args_in_task {
            task.arguments.clone()
        } else {
            None
        };

        Ok(args::terraform_stage_args(
            self.template.arguments.as_ref(),
            task_arguments.as_ref(),
            &task_params,
            &details.extra_vars,
            env_secrets,
        ))
    }

    /// Process environment for children: env-kind secrets plus the
    /// environment's process env override.
    fn child_env(&self, details: &JobDetails) -> Result<Vec<(String, String)>> {
        let mut env = Vec::new();
        let Some(environment) = &details.environment else {
            return Ok(env);
        };

        if let Some(raw) = &environment.env {
            if !raw.trim().is_empty() {
                let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)
                    .map_err(|e| CoreError::Config {
                        what: "environment env".to_string(),
                        details: e.to_string(),
                    })?;
                for (name, value) in parsed {
                    let value = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    env.push((name, value));
                }
            }
        }

        for secret in &environment.secrets {
            if secret.kind == crate::model::EnvironmentSecretKind::Env {
                env.push((secret.name.clone(), secret.secret.clone()));
            }
        }

        Ok(env)
    }

    fn app_command(
        &self,
        details: &JobDetails,
        cli: Vec<String>,
        env: Vec<(String, String)>,
    ) -> AppCommand {
        apps::build(
            self.template.app,
            &self.ctx.config,
            cli,
            &details.playbook_dir,
            &apps::home_dir(&self.ctx.config, &details.project_dir, &details.playbook_dir),
            env,
        )
    }

    /// Spawn a command in its own process group, streaming both output
    /// pipes through [`TaskRunner::log`] line by line. With
    /// `interactive` set, stdin stays open and a responder answers
    /// confirmation prompts from the status channel.
    async fn run_command(&self, cmd: &AppCommand, interactive: bool) -> Result<ExitStatus> {
        self.log(&cmd.display_line());

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .env_clear()
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);
        if interactive {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn().map_err(|e| CoreError::Internal {
            details: format!("spawning {}: {}", cmd.program, e),
        })?;

        let pgid = child.id().map(|id| id as i32);
        self.set_process_group(pgid);

        let responder = if interactive {
            child.stdin.take().map(|stdin| {
                tokio::spawn(respond_to_prompt(self.subscribe_status(), stdin))
            })
        } else {
            None
        };

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut lines_done = false;
        let mut exit_status: Option<ExitStatus> = None;
        while !(lines_done && exit_status.is_some()) {
            tokio::select! {
                maybe_line = line_rx.recv(), if !lines_done => match maybe_line {
                    Some(line) => {
                        self.log(&line);
                        // Terraform init state-migration prompt.
                        if interactive && line.contains("Do you want to copy ") {
                            self.set_status(TaskStatus::WaitingConfirmation).await;
                        }
                    }
                    None => lines_done = true,
                },
                status = child.wait(), if exit_status.is_none() => {
                    exit_status = Some(status.map_err(|e| CoreError::Internal {
                        details: format!("waiting for {}: {}", cmd.program, e),
                    })?);
                }
            }
        }

        self.set_process_group(None);
        if let Some(responder) = responder {
            responder.abort();
        }

        let Some(status) = exit_status else {
            return Err(CoreError::Internal {
                details: format!("{} produced no exit status", cmd.program),
            });
        };
        debug!(task_id = self.task_id, program = %cmd.program, code = ?status.code(), "command finished");
        Ok(status)
    }
}

async fn pump_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Answer a pending interactive prompt once the task's confirmation
/// status resolves: `yes` on confirm, `no` on reject, a bare newline
/// when the task ends some other way.
async fn respond_to_prompt(
    mut rx: watch::Receiver<TaskStatus>,
    mut stdin: tokio::process::ChildStdin,
) {
    loop {
        let status = *rx.borrow_and_update();
        let reply: Option<&[u8]> = match status {
            TaskStatus::Confirmed => Some(b"yes\n"),
            TaskStatus::Rejected => Some(b"no\n"),
            s if s.is_finished() => Some(b"\n"),
            _ => None,
        };

        if let Some(reply) = reply {
            let _ = stdin.write_all(reply).await;
            let _ = stdin.flush().await;
            break;
        }

        if rx.changed().await.is_err() {
            break;
        }
    }
}
