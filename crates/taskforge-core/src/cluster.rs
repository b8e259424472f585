// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership: node heartbeats and dead-node task failover.
//!
//! Every node upserts a heartbeat row on an interval. The orphan
//! cleaner periodically looks for tasks still marked in-flight whose
//! owning node stopped heartbeating and fails them, so a crashed node
//! cannot leave tasks stuck in `running` forever. The detection
//! threshold must stay well above the heartbeat interval to ride out
//! stalls that are not crashes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::hub::Hub;
use crate::model::{Event, Task, TaskStatus};
use crate::persistence::Repository;

/// Statuses the cleaner treats as "in flight on some node".
const IN_FLIGHT: [TaskStatus; 4] = [
    TaskStatus::Running,
    TaskStatus::Starting,
    TaskStatus::Stopping,
    TaskStatus::WaitingConfirmation,
];

/// Node id: hostname plus a random suffix, so a restarted node never
/// claims its predecessor's in-flight tasks.
pub fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", host, suffix)
}

/// Periodic heartbeat writer for this node.
pub struct NodeRegistry {
    repo: Arc<dyn Repository>,
    node_id: String,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl NodeRegistry {
    /// Create a registry for a node id.
    pub fn new(repo: Arc<dyn Repository>, node_id: String, interval: Duration) -> Self {
        Self {
            repo,
            node_id,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Handle used to stop the heartbeat loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Heartbeat loop. Writes immediately, then on every interval.
    pub async fn run(&self) {
        info!(
            node_id = %self.node_id,
            interval_secs = self.interval.as_secs(),
            "node registry started"
        );

        self.beat().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.interval) => self.beat().await,
            }
        }

        info!(node_id = %self.node_id, "node registry stopped");
    }

    async fn beat(&self) {
        if let Err(e) = self
            .repo
            .upsert_node_heartbeat(&self.node_id, Utc::now())
            .await
        {
            error!(node_id = %self.node_id, error = %e, "failed to write heartbeat");
        }
    }
}

/// Configuration for the orphan cleaner.
#[derive(Debug, Clone)]
pub struct OrphanCleanerConfig {
    /// How often to scan for orphaned tasks.
    pub poll_interval: Duration,
    /// Heartbeat age after which a node counts as dead. Keep this at
    /// 2-3x the heartbeat interval minimum.
    pub threshold: Duration,
}

impl Default for OrphanCleanerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            threshold: Duration::from_secs(45),
        }
    }
}

/// Background worker failing tasks owned by dead nodes.
pub struct OrphanCleaner {
    repo: Arc<dyn Repository>,
    hub: Hub,
    node_id: String,
    config: OrphanCleanerConfig,
    shutdown: Arc<Notify>,
}

impl OrphanCleaner {
    /// Create a cleaner for this node.
    pub fn new(
        repo: Arc<dyn Repository>,
        hub: Hub,
        node_id: String,
        config: OrphanCleanerConfig,
    ) -> Self {
        Self {
            repo,
            hub,
            node_id,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the cleaner loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Cleaner loop.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            threshold_secs = self.config.threshold.as_secs(),
            "orphan cleaner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_orphans().await {
                        error!(error = %e, "failed to check orphaned tasks");
                    }
                }
            }
        }

        info!("orphan cleaner stopped");
    }

    /// One scan: fail every in-flight task whose owning node's
    /// heartbeat is older than the threshold.
    pub async fn check_orphans(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let heartbeats: HashMap<String, DateTime<Utc>> = self
            .repo
            .list_node_heartbeats()
            .await?
            .into_iter()
            .map(|hb| (hb.node_id, hb.last_seen))
            .collect();

        let tasks = self.repo.list_tasks_with_status(&IN_FLIGHT).await?;
        if tasks.is_empty() {
            debug!("no in-flight tasks to reconcile");
            return Ok(());
        }

        for task in tasks {
            if self.node_is_alive(&task, &heartbeats, cutoff) {
                continue;
            }
            if let Err(e) = self.fail_orphan(&task).await {
                error!(task_id = task.id, error = %e, "failed to mark orphaned task");
            }
        }

        Ok(())
    }

    fn node_is_alive(
        &self,
        task: &Task,
        heartbeats: &HashMap<String, DateTime<Utc>>,
        cutoff: DateTime<Utc>,
    ) -> bool {
        match &task.node_id {
            // Tasks this very node owns are alive by definition.
            Some(node_id) if *node_id == self.node_id => true,
            Some(node_id) => heartbeats
                .get(node_id)
                .is_some_and(|last_seen| *last_seen >= cutoff),
            None => false,
        }
    }

    async fn fail_orphan(&self, task: &Task) -> Result<()> {
        warn!(
            task_id = task.id,
            project_id = task.project_id,
            node_id = ?task.node_id,
            status = %task.status,
            "failing orphaned task"
        );

        self.repo
            .update_task_status(task.id, TaskStatus::Fail, None, Some(Utc::now()))
            .await?;

        self.repo
            .create_event(Event {
                project_id: Some(task.project_id),
                object_type: "task".to_string(),
                object_id: Some(task.id),
                description: format!("Task {} finished - FAIL (orphaned)", task.id),
                created: Utc::now(),
            })
            .await?;

        let payload = serde_json::json!({
            "type": "update",
            "task_id": task.id,
            "template_id": task.template_id,
            "project_id": task.project_id,
            "status": TaskStatus::Fail,
        });
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            // Watcher sets are unknown here; deliver to everyone.
            self.hub.message(0, &bytes);
        }

        Ok(())
    }
}
