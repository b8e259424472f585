// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule pool: the cron engine and one-shot timer materializing
//! tasks on their due time.
//!
//! The pool mirrors the store's schedule table as in-memory entries.
//! `refresh()` rebuilds that mirror and runs on boot and after every
//! schedule mutation; `run()` drives a single timer loop that fires
//! due entries on their own spawned tasks. In HA mode an advisory
//! [`ScheduleDeduplicator`] keeps an occurrence from firing on more
//! than one node.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::model::{Schedule, ScheduleKind, Task};
use crate::persistence::Repository;
use crate::pool::TaskPool;
use crate::runner::git::GitContext;

/// Fallback sleep when no entry is armed.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// Advisory cluster-wide lock over one occurrence of a schedule.
///
/// At most one caller across the cluster observes true for a given
/// occurrence. Implementations must carry a finite lease so a crashed
/// holder cannot deadlock future occurrences, must not block
/// indefinitely, and should behave idempotently on retries. When the
/// backing store is unreachable the lock degrades to "everyone
/// fires"; that is logged but not fatal.
pub trait ScheduleDeduplicator: Send + Sync {
    /// Attempt to acquire the execution lock for this occurrence.
    /// Returns true when this node should fire the schedule.
    fn try_lock_execution(&self, schedule_id: i64) -> bool;
}

/// Timer for a `run_at` schedule: yields the run time exactly once,
/// then nothing forever after.
pub struct OneTimeSchedule {
    run_at: DateTime<Utc>,
    fired: AtomicBool,
}

impl OneTimeSchedule {
    /// Timer firing at `run_at`.
    pub fn new(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at,
            fired: AtomicBool::new(false),
        }
    }

    /// Next fire time after `t`: the run time while it is still in the
    /// future, None once it passed.
    pub fn next(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.fired.load(Ordering::SeqCst) {
            return None;
        }
        if t >= self.run_at {
            self.fired.store(true, Ordering::SeqCst);
            return None;
        }
        Some(self.run_at)
    }
}

/// Validate a standard 5-field cron string.
pub fn validate_cron_format(format: &str) -> Result<()> {
    parse_cron(format).map(|_| ())
}

/// Parse a standard 5-field cron string. The underlying parser wants
/// a seconds field, so one is prepended.
fn parse_cron(format: &str) -> Result<cron::Schedule> {
    if format.split_whitespace().count() != 5 {
        return Err(CoreError::Config {
            what: "cron format".to_string(),
            details: format!("'{}' is not a 5-field cron expression", format),
        });
    }

    format!("0 {}", format)
        .parse()
        .map_err(|e| CoreError::Config {
            what: "cron format".to_string(),
            details: format!("'{}': {}", format, e),
        })
}

enum EntryTiming {
    Cron(cron::Schedule),
    Once(OneTimeSchedule),
}

struct CronEntry {
    schedule_id: i64,
    project_id: i64,
    timing: EntryTiming,
    /// Fire time computed when the entry was armed; None until the
    /// driver arms it again.
    armed: Option<DateTime<Utc>>,
}

impl CronEntry {
    fn next_after(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match &self.timing {
            EntryTiming::Cron(schedule) => schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            EntryTiming::Once(once) => once.next(now),
        }
    }
}

/// The schedule pool.
pub struct SchedulePool {
    repo: Arc<dyn Repository>,
    task_pool: Arc<TaskPool>,
    tz: Tz,
    entries: Mutex<Vec<CronEntry>>,
    dedup: Mutex<Option<Arc<dyn ScheduleDeduplicator>>>,
    refreshed: Notify,
    shutdown: Notify,
    refreshes: AtomicU64,
}

impl SchedulePool {
    /// Create a pool bound to the configured cron time zone. Call
    /// [`SchedulePool::refresh`] before (or right after) spawning
    /// [`SchedulePool::run`].
    pub fn new(
        repo: Arc<dyn Repository>,
        task_pool: Arc<TaskPool>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let tz: Tz = config
            .schedule_timezone
            .parse()
            .map_err(|_| CoreError::Config {
                what: "schedule timezone".to_string(),
                details: format!("unknown time zone '{}'", config.schedule_timezone),
            })?;

        Ok(Arc::new(Self {
            repo,
            task_pool,
            tz,
            entries: Mutex::new(Vec::new()),
            dedup: Mutex::new(None),
            refreshed: Notify::new(),
            shutdown: Notify::new(),
            refreshes: AtomicU64::new(0),
        }))
    }

    /// Configure the HA deduplicator. When unset every node fires.
    pub fn set_deduplicator(&self, dedup: Option<Arc<dyn ScheduleDeduplicator>>) {
        *self.dedup.lock().unwrap_or_else(|e| e.into_inner()) = dedup;
    }

    /// Schedule ids currently mirrored as cron entries.
    pub fn entry_ids(&self) -> Vec<i64> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.schedule_id)
            .collect()
    }

    /// Number of refreshes performed since creation.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Stop the driver loop.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Rebuild the entry set from the store.
    ///
    /// A schedule becomes an entry when it has a repository reference
    /// or its active flag is set. `run_at` schedules whose time
    /// already passed never become entries: they are deleted when
    /// delete-after-run is set, deactivated otherwise.
    pub async fn refresh(&self) {
        let schedules = match self.repo.get_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "failed to get schedules");
                return;
            }
        };

        let now = Utc::now();
        let mut next = Vec::new();

        for schedule in schedules {
            if schedule.repository_id.is_none() && !schedule.active {
                continue;
            }

            match schedule.kind {
                ScheduleKind::RunAt => {
                    let Some(run_at) = schedule.run_at else {
                        warn!(
                            project_id = schedule.project_id,
                            schedule_id = schedule.id,
                            "run_at schedule has no run_at value"
                        );
                        continue;
                    };

                    if run_at <= now {
                        self.retire_past_run_at(&schedule).await;
                        continue;
                    }

                    next.push(CronEntry {
                        schedule_id: schedule.id,
                        project_id: schedule.project_id,
                        timing: EntryTiming::Once(OneTimeSchedule::new(run_at)),
                        armed: None,
                    });
                }
                ScheduleKind::Cron => {
                    if schedule.cron_format.is_empty() {
                        continue;
                    }
                    match parse_cron(&schedule.cron_format) {
                        Ok(parsed) => next.push(CronEntry {
                            schedule_id: schedule.id,
                            project_id: schedule.project_id,
                            timing: EntryTiming::Cron(parsed),
                            armed: None,
                        }),
                        Err(e) => {
                            error!(
                                project_id = schedule.project_id,
                                schedule_id = schedule.id,
                                error = %e,
                                "failed to add schedule"
                            );
                        }
                    }
                }
            }
        }

        let count = next.len();
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = next;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.refreshed.notify_one();
        debug!(entries = count, "schedule entries refreshed");
    }

    /// A `run_at` schedule whose time passed fires never: delete it
    /// when delete-after-run is set, deactivate it otherwise.
    async fn retire_past_run_at(&self, schedule: &Schedule) {
        if schedule.delete_after_run {
            if let Err(e) = self
                .repo
                .delete_schedule(schedule.project_id, schedule.id)
                .await
            {
                warn!(
                    project_id = schedule.project_id,
                    schedule_id = schedule.id,
                    error = %e,
                    "failed to delete past run_at schedule"
                );
            }
        } else if schedule.active {
            if let Err(e) = self
                .repo
                .set_schedule_active(schedule.project_id, schedule.id, false)
                .await
            {
                warn!(
                    project_id = schedule.project_id,
                    schedule_id = schedule.id,
                    error = %e,
                    "failed to deactivate past run_at schedule"
                );
            }
        }
    }

    /// Timer loop: sleeps until the nearest armed entry, fires due
    /// entries on their own tasks, re-arms. Interrupted by refreshes
    /// and stopped by [`SchedulePool::stop`].
    pub async fn run(self: Arc<Self>) {
        info!(timezone = %self.tz, "schedule pool started");

        loop {
            let now = Utc::now();
            let mut due = Vec::new();
            let mut next_wake: Option<DateTime<Utc>> = None;

            {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                for entry in entries.iter_mut() {
                    if entry.armed.is_none() {
                        entry.armed = entry.next_after(now, self.tz);
                    }
                    match entry.armed {
                        Some(at) if at <= now => {
                            due.push((entry.project_id, entry.schedule_id));
                            entry.armed = None;
                        }
                        Some(at) => {
                            next_wake = Some(next_wake.map_or(at, |cur| cur.min(at)));
                        }
                        None => {}
                    }
                }
            }

            for (project_id, schedule_id) in due {
                let pool = self.clone();
                tokio::spawn(async move { pool.fire(project_id, schedule_id).await });
            }

            let sleep_for = next_wake
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAKE);

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,
                _ = self.refreshed.notified() => continue,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!("schedule pool stopped");
    }

    /// Fire one occurrence of a schedule.
    ///
    /// Re-fetches the schedule (it may have changed since the last
    /// refresh), gates on the remote head for repository-bound
    /// schedules, hands off to the deduplicator in HA mode, and
    /// submits the materialized task. `run_at` schedules trigger a
    /// refresh afterwards so the now-retired entry leaves the cron.
    pub async fn fire(&self, project_id: i64, schedule_id: i64) {
        let schedule = match self.repo.get_schedule(project_id, schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return,
            Err(e) => {
                error!(project_id, schedule_id, error = %e, "failed to get schedule");
                return;
            }
        };

        if let Some(repository_id) = schedule.repository_id {
            match self.remote_head_moved(&schedule, repository_id).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    error!(
                        project_id,
                        schedule_id,
                        error = %e,
                        "failed to update schedule commit hash"
                    );
                    return;
                }
            }
        }

        let template = match self
            .repo
            .get_template(schedule.project_id, schedule.template_id)
            .await
        {
            Ok(Some(template)) => template,
            Ok(None) => {
                error!(
                    project_id,
                    schedule_id,
                    template_id = schedule.template_id,
                    "schedule references a missing template"
                );
                return;
            }
            Err(e) => {
                error!(project_id, schedule_id, error = %e, "failed to get template");
                return;
            }
        };

        // In HA mode, ensure only one node fires this occurrence.
        let dedup = self
            .dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(dedup) = dedup {
            if !dedup.try_lock_execution(schedule_id) {
                debug!(project_id, schedule_id, "schedule already executed by another node");
                // The winning node deactivates/deletes a one-shot
                // schedule after execution; refresh so this node's
                // cron drops the stale entry.
                if schedule.kind == ScheduleKind::RunAt {
                    self.refresh().await;
                }
                return;
            }
        }

        let mut task = match &schedule.task_params {
            Some(params) => params.to_task(schedule.project_id, schedule.template_id),
            None => Task::new(schedule.project_id, schedule.template_id),
        };
        task.schedule_id = Some(schedule.id);

        if let Err(e) = self
            .task_pool
            .add_task(
                task,
                None,
                "",
                schedule.project_id,
                template.app.needs_alias(),
            )
            .await
        {
            error!(
                project_id,
                schedule_id,
                template_id = schedule.template_id,
                error = %e,
                "failed to add task"
            );
        }

        // A one-shot schedule only triggers once: after the fire the
        // store holds it disabled (or deleted), and the refresh drops
        // it from the cron so it cannot fire again.
        if schedule.kind == ScheduleKind::RunAt {
            self.refresh().await;
        }
    }

    /// True when the remote branch head differs from the last
    /// observed hash; persists the new hash in that case.
    async fn remote_head_moved(&self, schedule: &Schedule, repository_id: i64) -> Result<bool> {
        let repository = self
            .repo
            .get_repository(schedule.project_id, repository_id)
            .await?
            .ok_or(CoreError::MissingDependency {
                kind: "repository",
                id: repository_id,
            })?;

        let git = GitContext {
            repository: &repository,
            dir: PathBuf::new(),
            ssh_key: None,
        };
        let head = git.remote_head().await?;

        if schedule.last_commit_hash.as_deref() == Some(head.as_str()) {
            return Ok(false);
        }

        self.repo
            .set_schedule_commit_hash(schedule.project_id, schedule.id, &head)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cron_format() {
        assert!(validate_cron_format("* * * *").is_err());
        assert!(validate_cron_format("* * 1 * *").is_ok());
        assert!(validate_cron_format("*/5 2 * * 1-5").is_ok());
        assert!(validate_cron_format("not a cron").is_err());
    }

    #[test]
    fn test_one_time_schedule_fires_once() {
        let now = Utc::now();
        let future = now + chrono::Duration::hours(1);
        let schedule = OneTimeSchedule::new(future);

        assert_eq!(schedule.next(now), Some(future));
        // Still pending until the time arrives.
        assert_eq!(schedule.next(now), Some(future));

        // At (or past) the run time it stops for good.
        assert_eq!(schedule.next(future), None);
        assert_eq!(schedule.next(now), None);
    }

    #[test]
    fn test_cron_entry_next_in_timezone() {
        let entry = CronEntry {
            schedule_id: 1,
            project_id: 1,
            timing: EntryTiming::Cron(parse_cron("30 * * * *").unwrap()),
            armed: None,
        };

        let now = Utc::now();
        let next = entry.next_after(now, chrono_tz::UTC).unwrap();
        assert!(next > now);
        assert_eq!(next.timestamp() % 3600, 1800);
    }
}
