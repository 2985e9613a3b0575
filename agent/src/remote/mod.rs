//! Remote API collaborators backed by HTTP.

mod http;
mod probe;

pub use http::HttpRemote;
pub use probe::Probe;
