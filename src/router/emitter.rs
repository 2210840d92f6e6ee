//! NodeEventEmitter - 节点事件推送
//!
//! 将连接状态变更以 `NodeStateEvent` 格式广播给订阅方。
//!
//! 设计要点：
//! - 每个事件携带 `generation`（单调递增），订阅方丢弃乱序事件
//! - 通过 `conn_to_nodes` 反向映射将 connectionId 转换为 nodeId
//!   （一条池化连接可以同时承载多个节点）
//! - 取 generation 与发送在同一把 emit 锁内完成；快照读取也在这把锁内，
//!   所以快照的 generation 永远不会领先于它读到的状态
//! - 没有订阅者时事件直接丢弃，订阅方初始化时通过快照对齐

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::sequencer::NodeEventSequencer;
use super::types::{NodeReadiness, NodeStateEvent, TerminalEndpoint};

use crate::ssh::ConnectionState;

/// 事件广播容量
const NODE_EVENT_CAPACITY: usize = 1024;

/// 将 ConnectionState 转换为 (NodeReadiness, 错误描述)
///
/// LinkDown / Reconnecting 都是可恢复状态，归为 Connecting；
/// LinkDown 通过 detail 区分。
pub(crate) fn state_to_readiness(state: &ConnectionState) -> (NodeReadiness, Option<String>) {
    match state {
        ConnectionState::Active | ConnectionState::Idle => (NodeReadiness::Ready, None),
        ConnectionState::Connecting | ConnectionState::Reconnecting => {
            (NodeReadiness::Connecting, None)
        }
        ConnectionState::LinkDown => (NodeReadiness::Connecting, Some("Link down".to_string())),
        ConnectionState::Error(msg) => (NodeReadiness::Error, Some(msg.clone())),
        ConnectionState::Disconnecting | ConnectionState::Disconnected => {
            (NodeReadiness::Disconnected, None)
        }
    }
}

/// 节点事件发射器
///
/// 共享实例（`Arc<NodeEventEmitter>`）分别注入到：
/// - `NodeRouter`：快照查询与节点级事件
/// - `SshConnectionRegistry`：连接状态变更时发射事件
pub struct NodeEventEmitter {
    /// generation 管理器
    sequencer: NodeEventSequencer,

    /// connectionId → nodeIds 反向映射
    conn_to_nodes: DashMap<String, Vec<String>>,

    events: broadcast::Sender<NodeStateEvent>,

    /// 发射与快照互斥
    emit_lock: parking_lot::Mutex<()>,
}

impl NodeEventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(NODE_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            sequencer: NodeEventSequencer::new(),
            conn_to_nodes: DashMap::new(),
            events,
            emit_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn sequencer(&self) -> &NodeEventSequencer {
        &self.sequencer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeStateEvent> {
        self.events.subscribe()
    }

    /// 在 emit 锁内执行 `f`：期间不会有任何节点事件被分配 generation
    pub fn consistent<R>(&self, f: impl FnOnce(&NodeEventSequencer) -> R) -> R {
        let _guard = self.emit_lock.lock();
        f(&self.sequencer)
    }

    // ========================================================================
    // 映射管理
    // ========================================================================

    /// 注册 connectionId → nodeId 映射（一个节点只属于一条连接）
    pub fn register(&self, connection_id: &str, node_id: &str) {
        self.unregister_node(node_id);
        debug!("NodeEventEmitter: register {} -> {}", connection_id, node_id);
        self.conn_to_nodes
            .entry(connection_id.to_string())
            .or_default()
            .push(node_id.to_string());
    }

    /// 注销 connectionId 的全部映射
    pub fn unregister(&self, connection_id: &str) {
        if let Some((_, nodes)) = self.conn_to_nodes.remove(connection_id) {
            debug!(
                "NodeEventEmitter: unregister {} (was nodes {:?})",
                connection_id, nodes
            );
        }
    }

    /// 从所有连接映射中移除节点
    pub fn unregister_node(&self, node_id: &str) {
        self.conn_to_nodes.retain(|_, nodes| {
            nodes.retain(|n| n != node_id);
            !nodes.is_empty()
        });
    }

    pub fn node_ids(&self, connection_id: &str) -> Vec<String> {
        self.conn_to_nodes
            .get(connection_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // 连接级事件（按 connectionId 扇出到节点）
    // ========================================================================

    /// 发射连接状态变更事件；未注册映射时静默跳过（如隧道中间跳）
    pub fn emit_connection_state_changed(
        &self,
        connection_id: &str,
        state: NodeReadiness,
        reason: &str,
    ) {
        let nodes = self.node_ids(connection_id);
        if nodes.is_empty() {
            debug!(
                "NodeEventEmitter: no nodeId mapping for connection {}, skipping",
                connection_id
            );
            return;
        }
        for node_id in nodes {
            self.emit_node_state(&node_id, state.clone(), reason);
        }
    }

    /// 便捷方法：直接从 ConnectionState 发射事件
    pub fn emit_state_from_connection(
        &self,
        connection_id: &str,
        conn_state: &ConnectionState,
        reason: &str,
    ) {
        let (readiness, detail) = state_to_readiness(conn_state);
        let effective_reason = match detail {
            Some(detail) if reason.is_empty() => detail,
            Some(detail) => format!("{}: {}", reason, detail),
            None => reason.to_string(),
        };
        self.emit_connection_state_changed(connection_id, readiness, &effective_reason);
    }

    /// 连接状态切换：节点可见的就绪状态没有变化时不发事件（如 Active ⇄ Idle）
    pub fn emit_transition(
        &self,
        connection_id: &str,
        prev: &ConnectionState,
        next: &ConnectionState,
        reason: &str,
    ) {
        if state_to_readiness(prev) == state_to_readiness(next) {
            return;
        }
        self.emit_state_from_connection(connection_id, next, reason);
    }

    /// 发射文件传输就绪状态变更事件
    pub fn emit_sftp_ready(&self, connection_id: &str, ready: bool, cwd: Option<String>) {
        for node_id in self.node_ids(connection_id) {
            self.emit_node_sftp_ready(&node_id, ready, cwd.clone());
        }
    }

    // ========================================================================
    // 节点级事件
    // ========================================================================

    pub fn emit_node_state(&self, node_id: &str, state: NodeReadiness, reason: &str) {
        self.emit(node_id, |node_id, generation| {
            NodeStateEvent::ConnectionStateChanged {
                node_id,
                generation,
                state,
                reason: reason.to_string(),
            }
        });
    }

    pub fn emit_node_sftp_ready(&self, node_id: &str, ready: bool, cwd: Option<String>) {
        self.emit(node_id, |node_id, generation| NodeStateEvent::SftpReady {
            node_id,
            generation,
            ready,
            cwd,
        });
    }

    /// 发射终端端点变更事件（由终端重建后调用）
    pub fn emit_terminal_endpoint_changed(&self, node_id: &str, endpoint: &TerminalEndpoint) {
        self.emit(node_id, |node_id, generation| {
            NodeStateEvent::TerminalEndpointChanged {
                node_id,
                generation,
                ws_port: endpoint.ws_port,
                ws_token: endpoint.ws_token.clone(),
                session_id: endpoint.session_id.clone(),
            }
        });
    }

    /// 节点永久删除：移除映射与计数器
    pub fn forget_node(&self, node_id: &str) {
        let _guard = self.emit_lock.lock();
        self.unregister_node(node_id);
        self.sequencer.remove(node_id);
    }

    fn emit(&self, node_id: &str, build: impl FnOnce(String, u64) -> NodeStateEvent) {
        let _guard = self.emit_lock.lock();
        let generation = self.sequencer.next(node_id);
        let event = build(node_id.to_string(), generation);
        debug!("NodeEventEmitter: emit {:?}", event);
        // 没有订阅者时 send 返回 Err，事件丢弃
        let _ = self.events.send(event);
    }
}

impl Default for NodeEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
