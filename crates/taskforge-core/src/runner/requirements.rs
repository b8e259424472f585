// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ansible galaxy requirements installation with MD5 change caching.
//!
//! Galaxy installs are slow, so each requirements file gets a sidecar
//! `<file>_<kind>.md5`; the install runs only when the file's hash no
//! longer matches the sidecar.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::{CoreError, Result};

/// Galaxy requirement kinds, each installed with its own subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalaxyRequirementKind {
    Role,
    Collection,
}

impl GalaxyRequirementKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::Collection => "collection",
        }
    }
}

/// Hex MD5 of a file's contents.
pub fn file_md5(path: &Path) -> Result<String> {
    let contents = std::fs::read(path).map_err(|e| CoreError::Requirements {
        reason: format!("{}: {}", path.display(), e),
    })?;
    let mut hasher = Md5::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Sidecar path recording the last installed hash of a requirements file.
pub fn hash_sidecar(requirements: &Path, kind: GalaxyRequirementKind) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}.md5",
        requirements.display(),
        kind.as_str()
    ))
}

/// True when the requirements file changed since the last recorded
/// install (or no record exists yet).
pub fn requirements_changed(requirements: &Path, sidecar: &Path) -> bool {
    let Ok(recorded) = std::fs::read_to_string(sidecar) else {
        return true;
    };
    match file_md5(requirements) {
        Ok(current) => recorded.trim() != current,
        Err(_) => true,
    }
}

/// Record the current hash of a requirements file.
pub fn write_requirements_hash(requirements: &Path, sidecar: &Path) -> Result<()> {
    let hash = file_md5(requirements)?;
    std::fs::write(sidecar, hash).map_err(|e| CoreError::Requirements {
        reason: format!("{}: {}", sidecar.display(), e),
    })
}

/// Candidate requirements file locations for a kind, most specific
/// first: the playbook directory and the repository root, with and
/// without the kind-specific subdirectory.
pub fn candidate_files(
    kind: GalaxyRequirementKind,
    playbook_dir: &Path,
    repo_dir: &Path,
) -> Vec<PathBuf> {
    let subdir = match kind {
        GalaxyRequirementKind::Role => "roles",
        GalaxyRequirementKind::Collection => "collections",
    };

    let mut candidates = vec![
        playbook_dir.join(subdir).join("requirements.yml"),
        playbook_dir.join("requirements.yml"),
        repo_dir.join(subdir).join("requirements.yml"),
        repo_dir.join("requirements.yml"),
    ];
    candidates.dedup();
    candidates
}

/// Galaxy invocation for one requirements file.
pub fn galaxy_install_args(kind: GalaxyRequirementKind, requirements: &Path) -> Vec<String> {
    vec![
        kind.as_str().to_string(),
        "install".to_string(),
        "-r".to_string(),
        requirements.display().to_string(),
        "--force".to_string(),
    ]
}
