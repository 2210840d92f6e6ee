//! Node-first commands
//!
//! 所有命令接受 nodeId 而非 sessionId / connectionId，
//! 内部通过 NodeRouter 解析到具体资源。

use tracing::info;

use super::CoreState;
use crate::router::{NodeStateSnapshot, RouteError, TerminalEndpoint};
use crate::ssh::ConnectTarget;

// ============================================================================
// 节点管理
// ============================================================================

/// 添加节点；`parent_id` 为 None 时为直连节点
pub fn node_add(
    state: &CoreState,
    parent_id: Option<&str>,
    target: ConnectTarget,
) -> Result<String, RouteError> {
    state.router.add_node(parent_id, target)
}

/// 删除节点及其子树，返回被删除的节点 ID
pub async fn node_remove(state: &CoreState, node_id: &str) -> Result<Vec<String>, RouteError> {
    state.router.remove_node(node_id).await
}

// ============================================================================
// 连接生命周期
// ============================================================================

pub async fn node_connect(state: &CoreState, node_id: &str) -> Result<String, RouteError> {
    state.router.connect_node(node_id).await
}

pub async fn node_disconnect(state: &CoreState, node_id: &str) -> Result<(), RouteError> {
    state.router.disconnect_node(node_id).await
}

/// 显式恢复节点（级联断开的子节点需要调用方触发）
pub async fn node_reconnect(state: &CoreState, node_id: &str) -> Result<String, RouteError> {
    info!("node_reconnect: {}", node_id);
    state.router.reconnect_node(node_id).await
}

// ============================================================================
// 文件传输
// ============================================================================

/// 获取（或创建）节点的文件传输能力，返回能力 ID
pub async fn node_acquire_sftp(state: &CoreState, node_id: &str) -> Result<String, RouteError> {
    let cap = state.router.acquire_sftp(node_id).await?;
    Ok(cap.slot_id.clone())
}

/// 释放节点的文件传输能力
pub async fn node_release_sftp(state: &CoreState, node_id: &str) -> Result<bool, RouteError> {
    state.router.release_sftp(node_id).await
}

pub async fn node_sftp_realpath(
    state: &CoreState,
    node_id: &str,
    path: &str,
) -> Result<String, RouteError> {
    state.router.node_sftp_realpath(node_id, path).await
}

// ============================================================================
// 终端
// ============================================================================

/// 获取节点的终端端点（必要时重建）
pub async fn node_terminal_url(
    state: &CoreState,
    node_id: &str,
) -> Result<TerminalEndpoint, RouteError> {
    state.router.resolve_interactive_endpoint(node_id).await
}

pub async fn node_close_terminal(state: &CoreState, node_id: &str) -> Result<bool, RouteError> {
    state.router.close_terminal(node_id).await
}

// ============================================================================
// 状态查询
// ============================================================================

/// 获取节点状态快照（含 generation，用于订阅方初始对齐）
pub fn node_get_state(state: &CoreState, node_id: &str) -> Result<NodeStateSnapshot, RouteError> {
    state.router.get_node_state(node_id)
}
