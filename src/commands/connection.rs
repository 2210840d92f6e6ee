//! Connection pool commands
//!
//! Address pooled connections by connection id. Errors cross the command
//! boundary as their message string.

use serde::Serialize;
use tracing::info;

use super::CoreState;
use crate::config::{save_pool_config, PoolConfig};
use crate::ssh::{ConnectTarget, ConnectionInfo, ConnectionPoolStats};

/// Result of the legacy file-transfer init
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpInitResult {
    pub capability_id: String,
    pub cwd: String,
}

/// Get (or open) a pooled connection to `target`
pub async fn connect(state: &CoreState, target: ConnectTarget) -> Result<String, String> {
    let entry = state
        .registry
        .resolve(&target)
        .await
        .map_err(|e| e.to_string())?;
    Ok(entry.id.clone())
}

/// Force-close a connection and everything tunneled through it
pub async fn disconnect(state: &CoreState, connection_id: &str) -> Result<(), String> {
    state
        .registry
        .force_close(connection_id)
        .await
        .map_err(|e| e.to_string())
}

pub async fn set_keep_alive(
    state: &CoreState,
    connection_id: &str,
    keep_alive: bool,
) -> Result<(), String> {
    state
        .registry
        .set_keep_alive(connection_id, keep_alive)
        .await
        .map_err(|e| e.to_string())
}

/// Stop an in-flight reconnect; the connection is closed
pub async fn cancel_reconnect(state: &CoreState, connection_id: &str) -> bool {
    state.registry.cancel_reconnect(connection_id).await
}

pub fn list_connections(state: &CoreState) -> Vec<ConnectionInfo> {
    state.registry.list_connections()
}

pub fn get_pool_stats(state: &CoreState) -> ConnectionPoolStats {
    state.registry.get_stats()
}

pub fn get_pool_config(state: &CoreState) -> PoolConfig {
    state.registry.config()
}

/// Apply a new pool config (persisted when the state has a config path)
///
/// Timers, heartbeats and reconnect jobs started afterwards use the new values.
pub async fn set_pool_config(state: &CoreState, config: PoolConfig) -> Result<(), String> {
    config.validate()?;
    if let Some(path) = state.config_path.as_deref() {
        save_pool_config(path, &config)
            .await
            .map_err(|e| e.to_string())?;
    }
    info!(
        "Pool config updated: idle_timeout={}s heartbeat={}s threshold={}",
        config.idle_timeout_secs, config.heartbeat_interval_secs, config.heartbeat_fail_threshold
    );
    state.registry.set_config(config);
    Ok(())
}

/// Legacy file-transfer init by connection id
///
/// Same creation path as `node_acquire_sftp`, so both return the same
/// capability.
pub async fn sftp_init(state: &CoreState, connection_id: &str) -> Result<SftpInitResult, String> {
    let (cap, _) = state
        .registry
        .acquire_file_transfer(connection_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(SftpInitResult {
        capability_id: cap.slot_id.clone(),
        cwd: cap.cwd().to_string(),
    })
}

/// Legacy counterpart of `sftp_init`: close the capability and return its
/// connection reference
pub async fn sftp_close(state: &CoreState, connection_id: &str) -> Result<bool, String> {
    state
        .registry
        .release_file_transfer(connection_id)
        .await
        .map_err(|e| e.to_string())
}
