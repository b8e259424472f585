// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live-update fanout: per-user WebSocket delivery with an optional
//! cross-node broadcaster.
//!
//! A single hub task owns the connection set; registration,
//! unregistration and broadcasts all flow through its command channel,
//! so no lock is ever taken on the set. A connection whose send buffer
//! is full is closed and evicted rather than blocking the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

/// Outbound message capacity per connection. A consumer that falls
/// this far behind is evicted.
const CONNECTION_BUFFER: usize = 64;

/// Identifier of one registered WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Cross-node delivery for HA setups. When configured, messages are
/// published to every node; each node delivers to its local clients
/// via [`Hub::local_broadcast`]. Implementations must not re-publish
/// messages they receive from other nodes.
pub trait Broadcaster: Send + Sync {
    /// Begin listening for messages from other nodes.
    fn start(&self);
    /// Deliver a message to all nodes in the cluster. The
    /// implementation must also deliver to local clients by calling
    /// [`Hub::local_broadcast`].
    fn publish(&self, user_id: i64, msg: &[u8]);
    /// Shut the broadcaster down.
    fn stop(&self);
}

struct Connection {
    user_id: i64,
    sender: mpsc::Sender<Vec<u8>>,
}

enum HubCommand {
    Register {
        id: ConnectionId,
        user_id: i64,
        sender: mpsc::Sender<Vec<u8>>,
    },
    Unregister(ConnectionId),
    Broadcast {
        user_id: i64,
        payload: Vec<u8>,
    },
}

/// Handle to the hub task. Cloneable; all clones talk to the same
/// connection set.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl Hub {
    /// Spawn the hub task. When a broadcaster is supplied it is
    /// started and every [`Hub::message`] goes through it.
    pub fn start(broadcaster: Option<Arc<dyn Broadcaster>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(rx));

        if let Some(b) = &broadcaster {
            b.start();
        }

        Self {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            broadcaster,
        }
    }

    /// Register a connection for a user. The returned sender half is
    /// owned by the hub; the caller pumps the receiver into its socket.
    pub fn register(&self, user_id: i64) -> (ConnectionId, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.commands.send(HubCommand::Register {
            id,
            user_id,
            sender,
        });
        (id, receiver)
    }

    /// Remove a connection. The connection's sender is dropped, which
    /// ends the caller's pump loop.
    pub fn unregister(&self, id: ConnectionId) {
        let _ = self.commands.send(HubCommand::Unregister(id));
    }

    /// Deliver a payload to one user's connections (or all connections
    /// when `user_id` is 0). Goes cluster-wide when a broadcaster is
    /// configured, otherwise this is exactly [`Hub::local_broadcast`].
    pub fn message(&self, user_id: i64, payload: &[u8]) {
        match &self.broadcaster {
            Some(b) => b.publish(user_id, payload),
            None => self.local_broadcast(user_id, payload),
        }
    }

    /// Deliver to locally-connected clients only. Used by broadcaster
    /// implementations to relay messages received from other nodes
    /// without re-publishing them.
    pub fn local_broadcast(&self, user_id: i64, payload: &[u8]) {
        let _ = self.commands.send(HubCommand::Broadcast {
            user_id,
            payload: payload.to_vec(),
        });
    }

    /// Stop the configured broadcaster, if any.
    pub fn stop_broadcaster(&self) {
        if let Some(b) = &self.broadcaster {
            b.stop();
        }
    }
}

async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut connections: HashMap<ConnectionId, Connection> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register {
                id,
                user_id,
                sender,
            } => {
                debug!(user_id, "websocket connection registered");
                connections.insert(id, Connection { user_id, sender });
            }
            HubCommand::Unregister(id) => {
                if connections.remove(&id).is_some() {
                    debug!("websocket connection unregistered");
                }
            }
            HubCommand::Broadcast { user_id, payload } => {
                let mut evicted = Vec::new();
                for (id, conn) in &connections {
                    if user_id > 0 && user_id != conn.user_id {
                        continue;
                    }
                    if conn.sender.try_send(payload.clone()).is_err() {
                        error!(
                            user_id = conn.user_id,
                            "connection send buffer full, closing connection"
                        );
                        evicted.push(*id);
                    }
                }
                for id in evicted {
                    // Dropping the sender closes the receiver, which
                    // tears down the underlying socket.
                    connections.remove(&id);
                }
            }
        }
    }
}
