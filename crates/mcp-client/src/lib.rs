//! MCP client plumbing.
//!
//! Protocol types, stdio and HTTP transports, a per-server client with the
//! initialize handshake, and the [`manager::McpClientManager`] that scopes
//! live clients by `(user, conversation, server)` with an idle reaper.

pub mod auth;
pub mod client;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::McpClient;
pub use config::{McpServerConfig, McpTransportKind};
pub use manager::{ClientKey, McpClientManager};
pub use transport::{ServerRequestHandler, TransportError};
