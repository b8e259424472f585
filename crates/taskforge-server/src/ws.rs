// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live-update WebSocket endpoint.
//!
//! Upgrades the connection, registers it with the hub under the
//! caller's user id and pumps hub payloads out until either side goes
//! away. Authentication happens upstream of this core; the handler
//! trusts the resolved user id it is handed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use taskforge_core::hub::Hub;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// User the connection belongs to; 0 receives broadcasts only.
    #[serde(default)]
    pub user_id: i64,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, query.user_id))
}

async fn handle_socket(socket: WebSocket, hub: Hub, user_id: i64) {
    let (mut sender, mut receiver) = socket.split();
    let (connection_id, mut outbound) = hub.register(user_id);
    debug!(user_id, "websocket connected");

    // Pump hub payloads to the socket.
    let pump = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            let text = String::from_utf8_lossy(&payload).into_owned();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        // Channel closed: the hub evicted this connection.
        let _ = sender.close().await;
    });

    // Inbound traffic is ignored; the read loop only notices closure.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    hub.unregister(connection_id);
    pump.abort();
    debug!(user_id, "websocket disconnected");
}
