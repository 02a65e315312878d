//! PostgreSQL proxy that routes clients by database name through SSH tunnels.
//!
//! The proxy reads the startup handshake, always refuses TLS, looks the
//! requested database up in a [`config::Registry`], dials the matching backend
//! through an SSH jump host and then relays bytes untouched.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod source;
pub mod tunnel;

pub use config::{Registry, Route, SshEndpoint};
pub use error::{ProxyError, ProxyResult};
pub use session::{run_server, ServerState};
pub use tunnel::{Tunnel, TunnelDialer};
