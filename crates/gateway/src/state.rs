//! Shared application state.
//!
//! One `AppState` is built at startup (or per test case) and handed to
//! every request handler and background task. There is no other global
//! mutable state.

use std::sync::Arc;

use agently_domain::config::Config;
use agently_mcp_client::McpClientManager;
use agently_providers::ProviderRegistry;
use agently_store::ConversationStore;
use agently_tools::ToolRegistry;

use crate::runtime::cancel::CancelMap;
use crate::runtime::elicitation::ElicitationRouter;
use crate::runtime::events::EventHub;
use crate::runtime::locks::ConversationLockMap;
use crate::runtime::tools::RemoteBridges;
use crate::workspace::WorkspaceStore;

/// Shared application state passed to all API handlers and runtime tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Durable conversation store (SQLite).
    pub store: Arc<ConversationStore>,
    /// Event stream hub (SSE + poll fan-out).
    pub hub: Arc<EventHub>,
    /// Elicitation waiter router.
    pub elicitations: Arc<ElicitationRouter>,
    /// Unified tool catalogue.
    pub registry: Arc<ToolRegistry>,
    /// LLM provider registry.
    pub providers: Arc<ProviderRegistry>,
    /// Per-(user, conversation, server) MCP clients.
    pub mcp: Arc<McpClientManager>,
    /// Workspace definition documents.
    pub workspace: Arc<WorkspaceStore>,
    /// Per-conversation turn serialization.
    pub locks: Arc<ConversationLockMap>,
    /// Per-conversation cancel tokens.
    pub cancel: Arc<CancelMap>,
    /// Server-initiated request bridges for remote MCP tools.
    pub remote_bridges: Arc<RemoteBridges>,
}
