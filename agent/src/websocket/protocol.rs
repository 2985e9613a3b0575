//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded with a `type` tag in snake_case. Engine events
//! are relayed unchanged inside `event`.

use ferry_engine::SyncEvent;
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Only relay the named events (`syncStarted`, `operationUpdated`, ...).
    /// An empty list restores the default of relaying everything.
    Subscribe {
        #[serde(default)]
        events: Vec<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An engine event.
    Event { event: SyncEvent },

    /// The relay fell behind and dropped events.
    Lagged { skipped: u64 },

    /// Acknowledges a subscribe request.
    Subscribed { events: Vec<String> },

    /// Response to ping.
    Pong,

    /// Error message.
    Error { message: String },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_deserialization() {
        let json = r#"{"type": "subscribe", "events": ["syncCompleted", "syncFailed"]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { events } => {
                assert_eq!(events, vec!["syncCompleted", "syncFailed"]);
            }
            _ => panic!("Expected Subscribe message"),
        }

        let json = r#"{"type": "ping"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn server_message_serialization() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let msg = ServerMessage::Event {
            event: SyncEvent::ReachabilityChanged { reachable: true },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["type"], "reachabilityChanged");
        assert_eq!(value["event"]["reachable"], true);

        let json = serde_json::to_string(&ServerMessage::error("bad frame")).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"bad frame""#));
    }
}
