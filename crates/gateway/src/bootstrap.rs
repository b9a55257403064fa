//! Runtime assembly: build an [`AppState`] from configuration and start
//! background tasks.

use std::sync::Arc;
use std::time::Duration;

use agently_domain::config::Config;
use agently_domain::error::Result;
use agently_mcp_client::McpClientManager;
use agently_providers::scripted::EchoProvider;
use agently_providers::ProviderRegistry;
use agently_store::{ConversationStore, Redactor};
use agently_tools::ToolRegistry;

use crate::runtime::cancel::CancelMap;
use crate::runtime::elicitation::ElicitationRouter;
use crate::runtime::events::EventHub;
use crate::runtime::locks::ConversationLockMap;
use crate::runtime::scheduler::Watchdog;
use crate::runtime::tools::{self, RemoteBridges};
use crate::state::AppState;
use crate::workspace::WorkspaceStore;

/// Build the full application state.
///
/// `providers` lets the caller wire real adapters; when empty, the echo
/// provider is registered so the gateway stays usable for development.
pub fn build_app_state(config: Arc<Config>, mut providers: ProviderRegistry) -> Result<AppState> {
    let state_path = config.state_path();
    std::fs::create_dir_all(&state_path)?;

    let redactor = Redactor::new(config.redact.keys.iter());
    let store = Arc::new(ConversationStore::open(&config.db_path(), redactor)?);

    if providers.is_empty() {
        tracing::warn!("no LLM providers registered; falling back to the echo provider");
        providers.register(Arc::new(EchoProvider::new()));
    }

    let mcp = Arc::new(McpClientManager::new(
        state_path,
        Duration::from_secs(config.mcp.client_ttl_sec),
        config.mcp.anonymous_scope,
    ));

    let state = AppState {
        workspace: Arc::new(WorkspaceStore::new(config.workspace_root())),
        config,
        store,
        hub: Arc::new(EventHub::new()),
        elicitations: Arc::new(ElicitationRouter::new()),
        registry: Arc::new(ToolRegistry::new()),
        providers: Arc::new(providers),
        mcp,
        locks: Arc::new(ConversationLockMap::new()),
        cancel: Arc::new(CancelMap::new()),
        remote_bridges: Arc::new(RemoteBridges::new()),
    };

    tools::register_builtins(&state);
    tools::register_virtual_agents(&state)?;

    tracing::info!(
        tools = state.registry.len(),
        workspace = %state.workspace.root().display(),
        "runtime assembled"
    );
    Ok(state)
}

/// Start long-lived background tasks: the MCP idle reaper and, when
/// enabled, the scheduler watchdog.
pub fn spawn_background_tasks(state: &AppState) {
    state.mcp.spawn_reaper();

    if state.config.scheduler.enabled {
        let watchdog = Watchdog::new(state.clone());
        let interval = Duration::from_secs(state.config.scheduler.interval_sec);
        tokio::spawn(async move {
            if let Err(e) = watchdog.run(false, interval).await {
                tracing::error!(error = %e, "scheduler watchdog exited");
            }
        });
    }
}

/// Serve the HTTP API until the process is stopped.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let router = crate::api::router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(agently_domain::error::Error::Io)?;
    tracing::info!(addr = %addr, "gateway listening");
    axum::serve(listener, router)
        .await
        .map_err(agently_domain::error::Error::Io)?;
    Ok(())
}
