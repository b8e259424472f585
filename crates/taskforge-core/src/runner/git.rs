// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git operations for task working copies, driven through the git CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::Repository;

use super::secrets::KeyInstallation;

/// A repository bound to a working copy location and an optional
/// installed SSH key.
pub struct GitContext<'a> {
    pub repository: &'a Repository,
    pub dir: PathBuf,
    pub ssh_key: Option<&'a KeyInstallation>,
}

impl GitContext<'_> {
    fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        if let Some(key) = self.ssh_key {
            env.extend(key.git_env());
        }
        env
    }

    async fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String> {
        run_git(cwd, args, &self.env()).await
    }

    /// Clone the repository or fast-forward an existing working copy
    /// to the remote branch head.
    pub async fn ensure_working_copy(&self) -> Result<()> {
        if self.dir.join(".git").is_dir() {
            debug!(dir = %self.dir.display(), "updating existing working copy");
            self.git(Some(&self.dir), &["fetch", "origin"]).await?;
            let target = format!("origin/{}", self.branch());
            self.git(Some(&self.dir), &["reset", "--hard", &target])
                .await?;
            return Ok(());
        }

        if let Some(parent) = self.dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Repo {
                reason: e.to_string(),
            })?;
        }

        debug!(url = %self.repository.git_url, "cloning repository");
        let dir = self.dir.display().to_string();
        let branch = self.branch();
        self.git(
            None,
            &[
                "clone",
                "--branch",
                &branch,
                "--single-branch",
                &self.repository.git_url,
                &dir,
            ],
        )
        .await?;
        Ok(())
    }

    /// Check out a specific commit in the working copy.
    pub async fn checkout(&self, commit: &str) -> Result<()> {
        self.git(Some(&self.dir), &["checkout", commit]).await?;
        Ok(())
    }

    /// Hash and subject of the working copy's HEAD commit.
    pub async fn head_commit(&self) -> Result<(String, String)> {
        let out = self
            .git(Some(&self.dir), &["log", "-1", "--format=%H%n%s"])
            .await?;
        let mut lines = out.lines();
        let hash = lines.next().unwrap_or_default().to_string();
        let subject = lines.next().unwrap_or_default().to_string();
        Ok((hash, subject))
    }

    /// Hash of the remote branch head, without touching the working copy.
    pub async fn remote_head(&self) -> Result<String> {
        let branch = self.branch();
        let out = self
            .git(
                None,
                &["ls-remote", &self.repository.git_url, &branch],
            )
            .await?;
        out.split_whitespace()
            .next()
            .map(str::to_string)
            .filter(|hash| !hash.is_empty())
            .ok_or_else(|| CoreError::Repo {
                reason: format!(
                    "no remote head for branch '{}' of {}",
                    branch, self.repository.git_url
                ),
            })
    }

    fn branch(&self) -> String {
        if self.repository.git_branch.is_empty() {
            "main".to_string()
        } else {
            self.repository.git_branch.clone()
        }
    }
}

async fn run_git(cwd: Option<&Path>, args: &[&str], env: &[(String, String)]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.output().await.map_err(|e| CoreError::Repo {
        reason: format!("git {}: {}", args.first().unwrap_or(&""), e),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::Repo {
            reason: format!(
                "git {} exited with {:?}: {}",
                args.first().unwrap_or(&""),
                output.status.code(),
                stderr.trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(url: &str) -> Repository {
        Repository {
            id: 1,
            project_id: 1,
            name: "fixture".to_string(),
            git_url: url.to_string(),
            git_branch: String::new(),
            ssh_key_id: None,
        }
    }

    #[test]
    fn test_branch_defaults_to_main() {
        let repo = repository("git@example.com:a.git");
        let ctx = GitContext {
            repository: &repo,
            dir: PathBuf::from("/tmp/wc"),
            ssh_key: None,
        };
        assert_eq!(ctx.branch(), "main");
    }

    #[tokio::test]
    async fn test_remote_head_fails_for_missing_remote() {
        let repo = repository("/nonexistent/path/to/repo.git");
        let ctx = GitContext {
            repository: &repo,
            dir: PathBuf::from("/tmp/wc"),
            ssh_key: None,
        };
        let err = ctx.remote_head().await.unwrap_err();
        assert_eq!(err.reason(), "repo_error");
    }

    #[tokio::test]
    async fn test_local_repository_round_trip() {
        // Build a throwaway git repo and verify clone + head lookup.
        let origin = tempfile::tempdir().unwrap();
        let origin_path = origin.path();

        let setup = [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "ci@example.com"],
            vec!["config", "user.name", "ci"],
        ];
        for args in &setup {
            let ok = std::process::Command::new("git")
                .args(args)
                .current_dir(origin_path)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !ok {
                // No usable git in this environment; nothing to verify.
                return;
            }
        }
        std::fs::write(origin_path.join("README"), "fixture\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "initial commit"]] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(origin_path)
                .output()
                .unwrap();
        }

        let work = tempfile::tempdir().unwrap();
        let repo = repository(&origin_path.display().to_string());
        let ctx = GitContext {
            repository: &repo,
            dir: work.path().join("wc"),
            ssh_key: None,
        };

        ctx.ensure_working_copy().await.unwrap();
        let (hash, subject) = ctx.head_commit().await.unwrap();
        assert_eq!(hash.len(), 40);
        assert_eq!(subject, "initial commit");

        let remote = ctx.remote_head().await.unwrap();
        assert_eq!(remote, hash);

        // Second call takes the fetch path.
        ctx.ensure_working_copy().await.unwrap();
    }
}
