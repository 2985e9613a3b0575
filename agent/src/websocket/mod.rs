//! WebSocket event stream for UI collaborators.
//!
//! Clients connect to `/events` and receive every engine event as JSON, or the
//! subset they subscribed to.

mod manager;
mod protocol;

pub use manager::{spawn_relay, ConnectionManager};
pub use protocol::*;
