// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration webhook entry point: `POST /integrations/{alias}`.
//!
//! The alias is the only credential; possession routes the request to
//! its integration. 204 when the integration matched and a task was
//! seeded, 404 when nothing matched, 500 on internal failure.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use tracing::{error, info};

use taskforge_core::dispatch;
use taskforge_core::error::Result;

use crate::AppState;

pub async fn receive_integration(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    match handle(&state, &alias, &headers, &body).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!(alias, error = %e, "integration dispatch failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn handle(
    state: &AppState,
    alias: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<bool> {
    let Some(alias_row) = state.repo.find_integration_alias(alias).await? else {
        return Ok(false);
    };
    let Some(integration) = state
        .repo
        .get_integration(alias_row.project_id, alias_row.integration_id)
        .await?
    else {
        return Ok(false);
    };

    let headers: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let matchers = state.repo.get_integration_matchers(integration.id).await?;
    if !dispatch::matches_all(&matchers, &headers, body) {
        return Ok(false);
    }

    let values = state
        .repo
        .get_integration_extract_values(integration.id)
        .await?;
    let task = dispatch::seed_task(&integration, &values, &headers, body)?;

    let Some(template) = state
        .repo
        .get_template(integration.project_id, integration.template_id)
        .await?
    else {
        return Ok(false);
    };

    let runner = state
        .pool
        .add_task(
            task,
            None,
            "",
            integration.project_id,
            template.app.needs_alias(),
        )
        .await?;

    info!(
        alias,
        integration_id = integration.id,
        task_id = runner.task_id,
        "integration matched, task seeded"
    );
    Ok(true)
}
