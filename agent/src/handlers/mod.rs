//! Long-lived connection handlers.

mod websocket;

pub use websocket::*;
