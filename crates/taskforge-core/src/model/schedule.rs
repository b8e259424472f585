// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule rows: cron rules and one-shot timers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskParams;

/// How a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Recurring, driven by a 5-field cron expression.
    #[default]
    Cron,
    /// Fires at most once at `run_at`.
    RunAt,
}

impl ScheduleKind {
    /// Stored type strings; the empty string is treated as `cron`.
    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "" | "cron" => Some(Self::Cron),
            "run_at" => Some(Self::RunAt),
            _ => None,
        }
    }

    /// String stored in the database.
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::RunAt => "run_at",
        }
    }
}

/// A persisted rule that materializes tasks on a time trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub project_id: i64,
    pub template_id: i64,
    #[serde(default)]
    pub kind: ScheduleKind,
    /// Standard 5-field cron string; only meaningful for `cron`.
    #[serde(default)]
    pub cron_format: String,
    /// Fire time; only meaningful for `run_at`.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    pub active: bool,
    /// Delete (instead of deactivate) a `run_at` schedule after it fires.
    #[serde(default)]
    pub delete_after_run: bool,
    /// When set, the schedule fires only if the remote head moved.
    #[serde(default)]
    pub repository_id: Option<i64>,
    #[serde(default)]
    pub last_commit_hash: Option<String>,
    #[serde(default)]
    pub task_params: Option<TaskParams>,
}
