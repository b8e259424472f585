// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskforge Server - automation task execution
//!
//! Boot wiring for the execution core: storage selection, the task
//! pool, the schedule pool, cluster membership and the HTTP surface.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use taskforge_core::cluster::{
    generate_node_id, NodeRegistry, OrphanCleaner, OrphanCleanerConfig,
};
use taskforge_core::config::Config;
use taskforge_core::hub::Hub;
use taskforge_core::persistence::{MemoryRepository, PostgresRepository, Repository};
use taskforge_core::pool::TaskPool;
use taskforge_core::runner::secrets::NoKeys;
use taskforge_core::scheduler::SchedulePool;
use taskforge_core::state::MemoryTaskState;
use taskforge_server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("taskforge_core=info".parse()?)
                .add_directive("taskforge_server=info".parse()?),
        )
        .init();

    info!("Starting Taskforge Server");

    let mut config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    // Storage: Postgres when configured, in-memory otherwise.
    let repo: Arc<dyn Repository> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

            info!("Running database migrations...");
            taskforge_core::migrations::run_postgres(&pool).await?;
            info!("Database ready");

            Arc::new(PostgresRepository::new(pool))
        }
        None => {
            info!("No database configured, using in-memory store");
            Arc::new(MemoryRepository::new())
        }
    };

    // Options stored alongside the data win over environment defaults.
    if let Some(cap) = repo.get_option("max_parallel_tasks").await? {
        match cap.parse() {
            Ok(cap) => config.max_parallel_tasks = cap,
            Err(_) => error!(value = %cap, "ignoring invalid max_parallel_tasks option"),
        }
    }
    let config = Arc::new(config);

    info!(
        bind_addr = %config.bind_addr,
        max_parallel_tasks = config.max_parallel_tasks,
        timezone = %config.schedule_timezone,
        "Configuration loaded"
    );

    let node_id = generate_node_id();
    info!(node_id = %node_id, "node identity assigned");

    let hub = Hub::start(None);

    let task_pool = TaskPool::start(
        repo.clone(),
        config.clone(),
        Arc::new(MemoryTaskState::new()),
        hub.clone(),
        Arc::new(NoKeys),
        node_id.clone(),
    );

    let schedule_pool = SchedulePool::new(repo.clone(), task_pool.clone(), &config)?;
    schedule_pool.refresh().await;
    tokio::spawn(schedule_pool.clone().run());

    let registry = Arc::new(NodeRegistry::new(
        repo.clone(),
        node_id.clone(),
        config.heartbeat_interval,
    ));
    let registry_task = registry.clone();
    tokio::spawn(async move { registry_task.run().await });

    let cleaner = Arc::new(OrphanCleaner::new(
        repo.clone(),
        hub.clone(),
        node_id.clone(),
        OrphanCleanerConfig {
            poll_interval: config.heartbeat_interval * 2,
            threshold: config.orphan_threshold,
        },
    ));
    let cleaner_task = cleaner.clone();
    tokio::spawn(async move { cleaner_task.run().await });

    let state = AppState {
        repo,
        pool: task_pool.clone(),
        hub: hub.clone(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down...");
    schedule_pool.stop();
    task_pool.shutdown();
    registry.shutdown_handle().notify_one();
    cleaner.shutdown_handle().notify_one();
    hub.stop_broadcaster();
    info!("Shutdown complete");

    Ok(())
}
