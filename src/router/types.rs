//! 路由层类型定义

use std::sync::Arc;

use serde::Serialize;

use crate::ssh::{ConnectionEntry, ConnectionRegistryError, HandleController};

// ============================================================================
// Route Error
// ============================================================================

/// 路由错误类型
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No active connection for node: {0}")]
    NotConnected(String),

    #[error("Connection in error state: {0}")]
    ConnectionError(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("{0}")]
    OperationError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),
}

impl From<ConnectionRegistryError> for RouteError {
    fn from(e: ConnectionRegistryError) -> Self {
        match &e {
            ConnectionRegistryError::NotFound(_)
            | ConnectionRegistryError::AlreadyDisconnected
            | ConnectionRegistryError::InvalidState(_) => RouteError::NotConnected(e.to_string()),
            ConnectionRegistryError::CapabilityFailed(_) => {
                RouteError::CapabilityUnavailable(e.to_string())
            }
            ConnectionRegistryError::LimitReached { .. }
            | ConnectionRegistryError::ConnectionFailed(_)
            | ConnectionRegistryError::AuthenticationFailed(_)
            | ConnectionRegistryError::ParentUnavailable(_) => {
                RouteError::ConnectionError(e.to_string())
            }
        }
    }
}

impl From<crate::session::TreeError> for RouteError {
    fn from(e: crate::session::TreeError) -> Self {
        match e {
            crate::session::TreeError::NodeNotFound(id) => RouteError::NodeNotFound(id),
        }
    }
}

impl Serialize for RouteError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// Resolved Connection
// ============================================================================

/// resolve_connection 的返回值：已解析的连接信息
///
/// `handle` 与 `handle_epoch` 在同一把读锁下取得，二者配对。
pub struct ResolvedConnection {
    pub connection_id: String,
    pub entry: Arc<ConnectionEntry>,
    pub handle: HandleController,
    pub handle_epoch: u64,
    pub terminal_session_id: Option<String>,
    pub sftp_session_id: Option<String>,
}

// ============================================================================
// Terminal Endpoint
// ============================================================================

/// 终端端点信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEndpoint {
    pub ws_port: u16,
    pub ws_token: String,
    pub session_id: String,
}

// ============================================================================
// Node State
// ============================================================================

/// 节点就绪状态（订阅方唯一需要关心的状态）
///
/// 序列化为 snake_case 字符串: "ready" | "connecting" | "error" | "disconnected"
/// 错误详情通过 NodeState.error 或 NodeStateEvent.reason 传递。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeReadiness {
    /// 完全就绪，可执行所有操作
    Ready,
    /// 正在连接 / 链路断开等待重连 / 重连中
    Connecting,
    /// 连接错误（详情见 NodeState.error）
    Error,
    /// 已断开
    Disconnected,
}

/// 节点完整状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub readiness: NodeReadiness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sftp_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sftp_cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<TerminalEndpoint>,
}

/// node_get_state 返回值：状态 + 当前 generation（快照对齐）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateSnapshot {
    pub state: NodeState,
    pub generation: u64,
}

// ============================================================================
// Node State Event
// ============================================================================

/// 后端状态变更事件
///
/// 有序性保证：每个事件携带 generation（每节点单调递增计数器），
/// 订阅方必须丢弃 generation <= 已见最大值的事件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeStateEvent {
    /// 连接状态变更
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        node_id: String,
        generation: u64,
        state: NodeReadiness,
        reason: String,
    },
    /// 文件传输就绪状态变更
    #[serde(rename_all = "camelCase")]
    SftpReady {
        node_id: String,
        generation: u64,
        ready: bool,
        cwd: Option<String>,
    },
    /// 终端端点变更（重建后端点会变化）
    #[serde(rename_all = "camelCase")]
    TerminalEndpointChanged {
        node_id: String,
        generation: u64,
        ws_port: u16,
        ws_token: String,
        session_id: String,
    },
}

impl NodeStateEvent {
    pub fn node_id(&self) -> &str {
        match self {
            NodeStateEvent::ConnectionStateChanged { node_id, .. }
            | NodeStateEvent::SftpReady { node_id, .. }
            | NodeStateEvent::TerminalEndpointChanged { node_id, .. } => node_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            NodeStateEvent::ConnectionStateChanged { generation, .. }
            | NodeStateEvent::SftpReady { generation, .. }
            | NodeStateEvent::TerminalEndpointChanged { generation, .. } => *generation,
        }
    }
}
