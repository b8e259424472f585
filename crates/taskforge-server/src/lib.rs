// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface for the Taskforge execution core.
//!
//! Two routes matter here: the integration webhook entry point and
//! the live-update WebSocket. Everything else about the server - REST
//! CRUD, auth, UI - lives outside this repository.

pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use taskforge_core::hub::Hub;
use taskforge_core::persistence::Repository;
use taskforge_core::pool::TaskPool;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub pool: Arc<TaskPool>,
    pub hub: Hub,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/integrations/{alias}", post(webhook::receive_integration))
        .route("/ws", get(ws::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
