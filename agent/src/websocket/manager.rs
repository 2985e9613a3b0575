//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections and fans engine events out to them.
//! Each connection can narrow the events it receives with a subscribe message.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use ferry_engine::SyncEvent;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Who opened the connection (bearer token label)
    pub client: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
    /// Event names to relay; empty relays everything
    pub events: HashSet<String>,
}

impl Connection {
    fn wants(&self, event: &SyncEvent) -> bool {
        self.events.is_empty() || self.events.contains(event.name())
    }
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connections by client for efficient lookup.
    by_client: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, client: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        let connection = Connection {
            id: conn_id.clone(),
            client: client.clone(),
            sender,
            events: HashSet::new(),
        };

        self.connections.insert(conn_id.clone(), connection);
        self.by_client
            .entry(client)
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_client.get_mut(&conn.client) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_client.remove(&conn.client);
                }
            }

            tracing::info!(conn_id = %conn_id, client = %conn.client, "WebSocket connection unregistered");
        }
    }

    /// Replace the event filter of a connection. Returns false if it is gone.
    pub fn subscribe(&self, conn_id: &str, events: impl IntoIterator<Item = String>) -> bool {
        match self.connections.get_mut(conn_id) {
            Some(mut conn) => {
                conn.events = events.into_iter().collect();
                true
            }
            None => false,
        }
    }

    /// Relay an engine event to every connection that wants it.
    ///
    /// Returns the number of connections that received the event.
    pub fn broadcast_event(&self, event: &SyncEvent) -> usize {
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.wants(event)
                && conn
                    .sender
                    .send(ServerMessage::Event {
                        event: event.clone(),
                    })
                    .is_ok()
            {
                sent_count += 1;
            }
        }

        tracing::trace!(
            event = event.name(),
            recipients = sent_count,
            "Relayed event to connections"
        );

        sent_count
    }

    /// Broadcast a message to all connections.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_all(&self, message: ServerMessage) -> usize {
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            if entry.value().sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of distinct clients connected.
    pub fn client_count(&self) -> usize {
        self.by_client.len()
    }
}

/// Pump engine events into the connection manager until the engine goes away.
pub fn spawn_relay(
    mut events: broadcast::Receiver<SyncEvent>,
    manager: Arc<ConnectionManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    manager.broadcast_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event relay lagged");
                    manager.broadcast_all(ServerMessage::Lagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("Event relay stopped");
    })
}
