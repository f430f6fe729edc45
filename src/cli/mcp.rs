use crate::infra::{
    CancellationToken, ResolveStateRootError, SessionStore, StoreError, resolve_state_root,
    sweep_best_effort,
};
use crate::logging::{InitLoggingError, init_logging};
use crate::mcp::{McpError, McpServer, SWEEP_INTERVAL, spawn_periodic_sweep};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpCommandError {
    #[error("resolve state root: {0}")]
    ResolveStateRoot(#[from] ResolveStateRootError),

    #[error("init state store: {0}")]
    InitStore(#[source] StoreError),

    #[error("init logger: {0}")]
    InitLogging(#[from] InitLoggingError),

    #[error("serve mcp: {0}")]
    Serve(#[from] McpError),
}

impl McpCommandError {
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// `derun mcp`: serves the store over stdio, sweeping expired sessions once
/// at startup and then periodically until the client disconnects.
pub fn execute_mcp() -> Result<(), McpCommandError> {
    let state_root = resolve_state_root()?;
    let store = SessionStore::open(&state_root).map_err(McpCommandError::InitStore)?;
    let _log_guard = init_logging(&state_root)?;
    tracing::info!(state_root = %state_root.display(), "mcp_started");

    sweep_best_effort(&store, None, None);
    let stop = CancellationToken::new();
    let sweeper = spawn_periodic_sweep(store.clone(), stop.clone(), SWEEP_INTERVAL);

    let served = McpServer::new(store).serve(io::stdin().lock(), io::stdout().lock());
    stop.cancel();
    let _ = sweeper.join();
    tracing::info!(ok = served.is_ok(), "mcp_stopped");
    Ok(served?)
}
