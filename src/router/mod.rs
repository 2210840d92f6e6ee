//! NodeRouter
//!
//! 节点路由器：将 nodeId 解析为具体的后端资源。
//! 所有 node_* 命令经由 NodeRouter 寻址，调用方不传递
//! sessionId / connectionId。
//!
//! NodeRouter 与 SshConnectionRegistry 共享同一个 NodeEventEmitter，
//! 连接层的状态切换与路由层的节点事件共用一条 generation 序列。

mod emitter;
mod sequencer;
mod types;

pub use emitter::NodeEventEmitter;
pub(crate) use emitter::state_to_readiness;
pub use sequencer::{GenerationWatermark, NodeEventSequencer};
pub use types::*;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::session::tree::NodeState as TreeNodeState;
use crate::session::{SessionRegistry, SharedSessionTree, TerminalBridge};
use crate::ssh::{
    CapabilityHandle, ChannelKind, ConnectTarget, ConnectionEntry, ConnectionRegistryError,
    ConnectionState, SshConnectionRegistry,
};

/// 节点路由器：将 nodeId 解析为具体的后端资源。
///
/// - 调用方只传 nodeId，所有 ID 解析在此完成
/// - 文件传输能力的唯一真源在 `ConnectionEntry` 的槽位里，路由器不持有索引
/// - 事件推送通过共享的 `NodeEventEmitter` 完成
pub struct NodeRouter {
    session_tree: SharedSessionTree,
    connection_registry: Arc<SshConnectionRegistry>,
    session_registry: Arc<SessionRegistry>,
    bridge: Arc<dyn TerminalBridge>,
    emitter: Arc<NodeEventEmitter>,
    /// 每节点一把锁，串行化终端端点的创建 / 重建
    terminal_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl NodeRouter {
    pub fn new(
        session_tree: SharedSessionTree,
        connection_registry: Arc<SshConnectionRegistry>,
        session_registry: Arc<SessionRegistry>,
        bridge: Arc<dyn TerminalBridge>,
        emitter: Arc<NodeEventEmitter>,
    ) -> Self {
        Self {
            session_tree,
            connection_registry,
            session_registry,
            bridge,
            emitter,
            terminal_locks: DashMap::new(),
        }
    }

    /// 获取共享的事件发射器
    pub fn emitter(&self) -> &Arc<NodeEventEmitter> {
        &self.emitter
    }

    /// 获取事件序列器引用（快捷方式）
    pub fn sequencer(&self) -> &NodeEventSequencer {
        self.emitter.sequencer()
    }

    pub fn session_tree(&self) -> &SharedSessionTree {
        &self.session_tree
    }

    // ========================================================================
    // 核心路由方法
    // ========================================================================

    /// 解析 nodeId 到一条可用连接。
    ///
    /// 内部处理：SessionTree 查找、状态门禁、重连等待。
    /// 返回的 handle 与 epoch 配对，供后续判断缓存资源是否过期。
    pub async fn resolve_connection(&self, node_id: &str) -> Result<ResolvedConnection, RouteError> {
        // Step 1: nodeId → SessionNode（读锁不跨 await）
        let (conn_id, terminal_session_id, sftp_session_id) = {
            let tree = self.session_tree.read();
            let node = tree
                .get_node(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.into()))?;
            let conn_id = node
                .ssh_connection_id
                .clone()
                .ok_or_else(|| RouteError::NotConnected(node_id.into()))?;
            (
                conn_id,
                node.terminal_session_id.clone(),
                node.sftp_session_id.clone(),
            )
        };

        // Step 2: connectionId → ConnectionEntry
        let entry = self
            .connection_registry
            .get_connection(&conn_id)
            .ok_or_else(|| RouteError::NotConnected(node_id.into()))?;

        // Step 3: 状态门禁
        let state = entry.state();
        match state {
            ConnectionState::Active | ConnectionState::Idle => {}
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                debug!(
                    "Node {} connection {} is {}, waiting...",
                    node_id,
                    conn_id,
                    state.as_str()
                );
                self.wait_for_ready(&entry).await?;
            }
            ConnectionState::LinkDown if self.connection_registry.has_reconnect_job(&conn_id) => {
                debug!(
                    "Node {} connection {} is link_down with a reconnect job, waiting...",
                    node_id, conn_id
                );
                self.wait_for_ready(&entry).await?;
            }
            ConnectionState::LinkDown => {
                return Err(RouteError::NotConnected(format!(
                    "Node {} connection {} is link_down",
                    node_id, conn_id
                )));
            }
            ConnectionState::Error(msg) => return Err(RouteError::ConnectionError(msg)),
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                return Err(RouteError::NotConnected(node_id.into()));
            }
        }

        if entry.is_closing() {
            return Err(RouteError::NotConnected(node_id.into()));
        }

        let (handle, handle_epoch) = entry.handle_with_epoch();
        Ok(ResolvedConnection {
            connection_id: conn_id,
            entry,
            handle,
            handle_epoch,
            terminal_session_id,
            sftp_session_id,
        })
    }

    /// 获取或创建该节点的文件传输能力。
    ///
    /// 委托给 `SshConnectionRegistry::acquire_file_transfer`（与按连接 ID
    /// 的旧路径同一条创建路径）。新建 / 重建时由注册表发射 SftpReady。
    pub async fn acquire_sftp(&self, node_id: &str) -> Result<CapabilityHandle, RouteError> {
        let resolved = self.resolve_connection(node_id).await?;

        let (cap, outcome) = self
            .connection_registry
            .acquire_file_transfer(&resolved.connection_id)
            .await
            .map_err(|e| match e {
                ConnectionRegistryError::CapabilityFailed(msg) => {
                    RouteError::CapabilityUnavailable(format!("SFTP init failed: {}", msg))
                }
                other => other.into(),
            })?;

        if outcome.is_new() {
            info!(
                "Node {} file transfer {:?} (instance {}, epoch {})",
                node_id, outcome, cap.instance, cap.epoch
            );
        }

        self.session_tree
            .write()
            .set_sftp_session_id(node_id, Some(cap.slot_id.clone()))?;

        Ok(cap)
    }

    /// 丢弃当前实例并重新获取
    pub async fn invalidate_and_reacquire_sftp(
        &self,
        node_id: &str,
    ) -> Result<CapabilityHandle, RouteError> {
        let resolved = self.resolve_connection(node_id).await?;
        self.connection_registry
            .invalidate_file_transfer(&resolved.entry)
            .await;
        self.acquire_sftp(node_id).await
    }

    /// 释放该节点连接上的文件传输能力（归还其占用的连接引用）
    ///
    /// 返回是否确实释放了一个实例。
    pub async fn release_sftp(&self, node_id: &str) -> Result<bool, RouteError> {
        let conn_id = {
            let tree = self.session_tree.read();
            let node = tree
                .get_node(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.to_string()))?;
            node.ssh_connection_id
                .clone()
                .ok_or_else(|| RouteError::NotConnected(node_id.into()))?
        };

        let released = self
            .connection_registry
            .release_file_transfer(&conn_id)
            .await?;
        self.session_tree.write().set_sftp_session_id(node_id, None)?;
        Ok(released)
    }

    /// 远端路径规范化
    ///
    /// 通道损坏时失效当前实例、重新获取并重试一次。
    pub async fn node_sftp_realpath(&self, node_id: &str, path: &str) -> Result<String, RouteError> {
        let cap = self.acquire_sftp(node_id).await?;
        match cap.realpath(path).await {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.is_channel_broken() => {
                warn!(
                    "Node {} file transfer instance {} broken ({}), rebuilding",
                    node_id, cap.instance, e
                );
                let resolved = self.resolve_connection(node_id).await?;
                self.connection_registry
                    .invalidate_file_transfer_instance(&resolved.entry, cap.instance)
                    .await;
                let cap = self.acquire_sftp(node_id).await?;
                cap.realpath(path)
                    .await
                    .map_err(|e| RouteError::OperationError(e.to_string()))
            }
            Err(e) => Err(RouteError::OperationError(e.to_string())),
        }
    }

    /// 获取该节点的交互式终端端点。
    ///
    /// 现有会话仍建立在当前 handle 上且桥接仍在时直接返回；否则在解析到的
    /// 连接上重建会话并发射 TerminalEndpointChanged。同一节点串行执行。
    pub async fn resolve_interactive_endpoint(
        &self,
        node_id: &str,
    ) -> Result<TerminalEndpoint, RouteError> {
        let lock = self.terminal_lock(node_id);
        let _serial = lock.lock().await;

        let resolved = self.resolve_connection(node_id).await?;

        if let Some(session_id) = resolved.terminal_session_id.as_deref() {
            let live = self
                .session_registry
                .with_session(session_id, |entry| {
                    if entry.connection_id == resolved.connection_id
                        && entry.handle_epoch == resolved.handle_epoch
                    {
                        entry.endpoint.clone()
                    } else {
                        None
                    }
                })
                .flatten();

            match live {
                Some(endpoint) if self.bridge.is_attached(session_id) => return Ok(endpoint),
                _ => debug!(
                    "Node {} terminal session {} is stale, rebuilding",
                    node_id, session_id
                ),
            }
        }

        self.rebuild_terminal(node_id, &resolved).await
    }

    /// 关闭节点的终端会话；没有会话时返回 false
    pub async fn close_terminal(&self, node_id: &str) -> Result<bool, RouteError> {
        let lock = self.terminal_lock(node_id);
        let _serial = lock.lock().await;

        let session_id = {
            let mut tree = self.session_tree.write();
            let node = tree
                .get_node_mut(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.into()))?;
            node.terminal_session_id.take()
        };

        match session_id {
            Some(session_id) => {
                self.retire_session(&session_id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // 节点生命周期
    // ========================================================================

    /// 添加节点（parent 为 None 时为直连节点）
    pub fn add_node(
        &self,
        parent_id: Option<&str>,
        target: ConnectTarget,
    ) -> Result<String, RouteError> {
        let mut tree = self.session_tree.write();
        let node_id = match parent_id {
            Some(parent_id) => tree.drill_down(parent_id, target)?,
            None => tree.add_root_node(target),
        };
        Ok(node_id)
    }

    /// 为节点建立（或复用）连接并绑定
    ///
    /// 有父节点时经父节点的连接建立隧道。
    pub async fn connect_node(&self, node_id: &str) -> Result<String, RouteError> {
        let (target, parent_node_id, previous) = {
            let tree = self.session_tree.read();
            let node = tree
                .get_node(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.into()))?;
            (
                node.connection.clone(),
                node.parent_id.clone(),
                node.ssh_connection_id.clone(),
            )
        };

        if let Some(conn_id) = previous.as_deref() {
            if self.connection_registry.is_alive(conn_id) {
                debug!("Node {} already bound to live connection {}", node_id, conn_id);
                return Ok(conn_id.to_string());
            }
        }

        self.session_tree
            .write()
            .update_state(node_id, TreeNodeState::Connecting)?;
        self.emitter
            .emit_node_state(node_id, NodeReadiness::Connecting, "connecting");

        let result = match parent_node_id {
            Some(parent_node_id) => match self.live_connection_of(&parent_node_id) {
                Some(parent_conn) => self
                    .connection_registry
                    .resolve_tunneled(&parent_conn, &target)
                    .await
                    .map_err(RouteError::from),
                None => Err(RouteError::NotConnected(format!(
                    "parent node {} is not connected",
                    parent_node_id
                ))),
            },
            None => self
                .connection_registry
                .resolve(&target)
                .await
                .map_err(RouteError::from),
        };

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Node {} connect failed: {}", node_id, e);
                self.session_tree.write().update_state(
                    node_id,
                    TreeNodeState::Failed {
                        error: e.to_string(),
                    },
                )?;
                self.emitter
                    .emit_node_state(node_id, NodeReadiness::Error, &e.to_string());
                return Err(e);
            }
        };

        {
            let mut tree = self.session_tree.write();
            tree.set_ssh_connection_id(node_id, Some(entry.id.clone()))?;
            tree.update_state(node_id, TreeNodeState::Connected)?;
        }
        self.emitter.register(&entry.id, node_id);
        self.emitter
            .emit_node_state(node_id, NodeReadiness::Ready, "connected");
        info!("Node {} bound to connection {}", node_id, entry.id);

        // 旧绑定已不可用且没有其他节点在用时回收
        if let Some(old) = previous.filter(|old| *old != entry.id) {
            self.close_if_unbound(&old).await;
        }

        Ok(entry.id.clone())
    }

    /// 恢复节点连接
    ///
    /// - 可用：直接返回
    /// - LinkDown 且没有重连任务（级联后的子连接）：原位重建
    /// - 重连中：等待结果
    /// - 终态 / 未绑定：重新建立
    pub async fn reconnect_node(&self, node_id: &str) -> Result<String, RouteError> {
        let bound = {
            let tree = self.session_tree.read();
            tree.get_node(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.into()))?
                .ssh_connection_id
                .clone()
        };

        let Some(entry) = bound.and_then(|id| self.connection_registry.get_connection(&id)) else {
            return self.connect_node(node_id).await;
        };

        match entry.state() {
            ConnectionState::Active | ConnectionState::Idle => Ok(entry.id.clone()),
            ConnectionState::LinkDown if !self.connection_registry.has_reconnect_job(&entry.id) => {
                info!("Node {} reestablishing connection {}", node_id, entry.id);
                self.connection_registry.reestablish(&entry.id).await?;
                Ok(entry.id.clone())
            }
            ConnectionState::LinkDown
            | ConnectionState::Reconnecting
            | ConnectionState::Connecting => {
                self.wait_for_ready(&entry).await?;
                Ok(entry.id.clone())
            }
            ConnectionState::Error(_)
            | ConnectionState::Disconnecting
            | ConnectionState::Disconnected => self.connect_node(node_id).await,
        }
    }

    /// 断开节点：关闭终端、解除绑定；连接不再被任何节点使用时强制断开
    pub async fn disconnect_node(&self, node_id: &str) -> Result<(), RouteError> {
        self.close_terminal(node_id).await?;

        let previous = {
            let mut tree = self.session_tree.write();
            let node = tree
                .get_node_mut(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.into()))?;
            node.sftp_session_id = None;
            node.state = TreeNodeState::Disconnected;
            node.ssh_connection_id.take()
        };

        self.emitter
            .emit_node_state(node_id, NodeReadiness::Disconnected, "disconnected");
        self.emitter.unregister_node(node_id);

        if let Some(conn_id) = previous {
            info!("Node {} unbound from connection {}", node_id, conn_id);
            self.close_if_unbound(&conn_id).await;
        }
        Ok(())
    }

    /// 删除节点及其子树（最深的先断开）
    pub async fn remove_node(&self, node_id: &str) -> Result<Vec<String>, RouteError> {
        let subtree = self.subtree_of(node_id)?;
        for id in subtree.iter().rev() {
            if let Err(e) = self.disconnect_node(id).await {
                debug!("Node {} disconnect before removal: {}", id, e);
            }
        }

        let removed = self.session_tree.write().remove_node(node_id)?;
        for id in &removed {
            self.emitter.forget_node(id);
            self.terminal_locks.remove(id);
        }
        Ok(removed)
    }

    // ========================================================================
    // 快照
    // ========================================================================

    /// 获取节点当前状态快照（含 generation，用于订阅方初始对齐）。
    ///
    /// 在 emit 锁内读取：快照的 generation 不会领先于它读到的状态。
    pub fn get_node_state(&self, node_id: &str) -> Result<NodeStateSnapshot, RouteError> {
        self.emitter
            .consistent(|seq| self.snapshot_locked(node_id, seq.current(node_id)))
    }

    /// 订阅事件并原子地取得快照
    pub fn subscribe_with_snapshot(
        &self,
        node_id: &str,
    ) -> Result<(broadcast::Receiver<NodeStateEvent>, NodeStateSnapshot), RouteError> {
        self.emitter.consistent(|seq| {
            let rx = self.emitter.subscribe();
            let snapshot = self.snapshot_locked(node_id, seq.current(node_id))?;
            Ok((rx, snapshot))
        })
    }

    fn snapshot_locked(&self, node_id: &str, generation: u64) -> Result<NodeStateSnapshot, RouteError> {
        let (conn_id, tree_state, terminal_session_id) = {
            let tree = self.session_tree.read();
            let node = tree
                .get_node(node_id)
                .ok_or_else(|| RouteError::NodeNotFound(node_id.into()))?;
            (
                node.ssh_connection_id.clone(),
                node.state.clone(),
                node.terminal_session_id.clone(),
            )
        };

        let entry = conn_id
            .as_deref()
            .and_then(|id| self.connection_registry.get_connection(id));

        let (readiness, detail) = match (&conn_id, &entry) {
            (Some(_), Some(entry)) => state_to_readiness(&entry.state()),
            (Some(_), None) => (NodeReadiness::Disconnected, None),
            // 没有 connection_id，看 SessionTree node state
            (None, _) => match tree_state {
                TreeNodeState::Connecting => (NodeReadiness::Connecting, None),
                TreeNodeState::Connected => (NodeReadiness::Ready, None),
                TreeNodeState::Failed { error } => (NodeReadiness::Error, Some(error)),
                TreeNodeState::Disconnected | TreeNodeState::Pending => {
                    (NodeReadiness::Disconnected, None)
                }
            },
        };
        let error = if readiness == NodeReadiness::Error {
            detail
        } else {
            None
        };

        let sftp_cwd = entry.as_ref().and_then(|e| e.sftp_status());
        let ws_endpoint = terminal_session_id
            .as_deref()
            .and_then(|sid| self.session_registry.endpoint(sid));

        Ok(NodeStateSnapshot {
            state: NodeState {
                readiness,
                error,
                sftp_ready: sftp_cwd.is_some(),
                sftp_cwd,
                ws_endpoint,
            },
            generation,
        })
    }

    // ========================================================================
    // 内部辅助方法
    // ========================================================================

    /// 等待连接变为 Active / Idle（带超时）
    async fn wait_for_ready(&self, entry: &ConnectionEntry) -> Result<(), RouteError> {
        let max_wait = self.connection_registry.config().connect_wait_timeout();
        let mut rx = entry.subscribe_state();

        let result = timeout(max_wait, async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Active | ConnectionState::Idle => return Ok(()),
                    ConnectionState::Error(msg) => return Err(RouteError::ConnectionError(msg)),
                    ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                        return Err(RouteError::NotConnected(entry.id.clone()))
                    }
                    ConnectionState::LinkDown => {
                        // 心跳判定 LinkDown 后紧接着排入重连任务
                        tokio::task::yield_now().await;
                        if !self.connection_registry.has_reconnect_job(&entry.id)
                            && entry.state() == ConnectionState::LinkDown
                        {
                            return Err(RouteError::NotConnected(format!(
                                "connection {} is link_down",
                                entry.id
                            )));
                        }
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(RouteError::NotConnected(entry.id.clone()));
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(RouteError::ConnectionTimeout(format!(
                "Timed out waiting for connection {} to become active ({:?})",
                entry.id, max_wait
            ))),
        }
    }

    fn terminal_lock(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.terminal_locks
            .entry(node_id.to_string())
            .or_default()
            .clone()
    }

    /// 新建会话：打开 session channel → 注册 → 桥接 → 计入引用 → 更新节点 → 退役旧会话
    async fn rebuild_terminal(
        &self,
        node_id: &str,
        resolved: &ResolvedConnection,
    ) -> Result<TerminalEndpoint, RouteError> {
        let channel = resolved
            .handle
            .open_channel(ChannelKind::Session)
            .await
            .map_err(|e| {
                RouteError::CapabilityUnavailable(format!("terminal channel open failed: {}", e))
            })?;

        let session_id = self
            .session_registry
            .create_session(
                node_id,
                &resolved.connection_id,
                resolved.handle_epoch,
                channel,
            )
            .map_err(|e| RouteError::OperationError(e.to_string()))?;

        let attachment = match self.bridge.attach(&session_id).await {
            Ok(attachment) => attachment,
            Err(e) => {
                self.discard_session(&session_id).await;
                return Err(RouteError::OperationError(format!(
                    "terminal bridge attach failed: {}",
                    e
                )));
            }
        };

        let endpoint = TerminalEndpoint {
            ws_port: attachment.port,
            ws_token: attachment.token,
            session_id: session_id.clone(),
        };
        if let Err(e) = self
            .session_registry
            .set_endpoint(&session_id, endpoint.clone())
        {
            self.discard_session(&session_id).await;
            return Err(RouteError::OperationError(e.to_string()));
        }

        // 先计入新会话再退役旧会话，引用计数不会短暂归零
        if let Err(e) = self
            .connection_registry
            .add_terminal(&resolved.connection_id, &session_id)
            .await
        {
            self.discard_session(&session_id).await;
            return Err(e.into());
        }

        let bound = self
            .session_tree
            .write()
            .set_terminal_session_id(node_id, Some(session_id.clone()));
        if let Err(e) = bound {
            self.retire_session(&session_id).await;
            return Err(e.into());
        }

        if let Some(old) = resolved.terminal_session_id.as_deref() {
            if old != session_id {
                self.retire_session(old).await;
            }
        }

        info!(
            "Node {} terminal session {} ready on connection {} (epoch {})",
            node_id, session_id, resolved.connection_id, resolved.handle_epoch
        );
        self.emitter
            .emit_terminal_endpoint_changed(node_id, &endpoint);
        Ok(endpoint)
    }

    /// 撤销尚未计入引用的会话
    async fn discard_session(&self, session_id: &str) {
        self.bridge.detach(session_id).await;
        if let Err(e) = self.session_registry.close_session(session_id).await {
            debug!("Discarding session {}: {}", session_id, e);
        }
    }

    /// 退役会话：断开桥接、关闭通道、释放连接引用
    async fn retire_session(&self, session_id: &str) {
        let connection_id = self
            .session_registry
            .with_session(session_id, |s| s.connection_id.clone());

        self.discard_session(session_id).await;

        if let Some(connection_id) = connection_id {
            if let Err(e) = self
                .connection_registry
                .remove_terminal(&connection_id, session_id)
                .await
            {
                debug!(
                    "Session {} release on connection {}: {}",
                    session_id, connection_id, e
                );
            }
        }
    }

    /// 节点绑定的连接（仅在可用时）
    fn live_connection_of(&self, node_id: &str) -> Option<String> {
        let conn_id = self
            .session_tree
            .read()
            .get_node(node_id)
            .and_then(|n| n.ssh_connection_id.clone())?;
        self.connection_registry
            .is_alive(&conn_id)
            .then_some(conn_id)
    }

    /// 没有节点再绑定该连接时强制断开
    async fn close_if_unbound(&self, connection_id: &str) {
        let still_bound = !self
            .session_tree
            .read()
            .nodes_for_connection(connection_id)
            .is_empty();
        if still_bound {
            return;
        }
        match self.connection_registry.force_close(connection_id).await {
            Ok(()) => info!("Connection {} closed (no bound nodes)", connection_id),
            Err(e) => debug!("Connection {} not closed: {}", connection_id, e),
        }
    }

    /// 节点及其全部后代（广度优先）
    fn subtree_of(&self, node_id: &str) -> Result<Vec<String>, RouteError> {
        let tree = self.session_tree.read();
        if tree.get_node(node_id).is_none() {
            return Err(RouteError::NodeNotFound(node_id.into()));
        }
        let mut ids = vec![node_id.to_string()];
        let mut cursor = 0;
        while cursor < ids.len() {
            if let Some(node) = tree.get_node(&ids[cursor]) {
                ids.extend(node.children_ids.iter().cloned());
            }
            cursor += 1;
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PoolConfig;
    use crate::session::{SessionTree, TokenBridge};
    use crate::ssh::testing::{target, MockConnector};

    struct Harness {
        router: Arc<NodeRouter>,
        registry: Arc<SshConnectionRegistry>,
        connector: Arc<MockConnector>,
        emitter: Arc<NodeEventEmitter>,
        tree: SharedSessionTree,
        sessions: Arc<SessionRegistry>,
    }

    fn harness(config: PoolConfig) -> Harness {
        let connector = Arc::new(MockConnector::new());
        let emitter = Arc::new(NodeEventEmitter::new());
        let registry = SshConnectionRegistry::new(connector.clone(), emitter.clone(), config);
        let tree: SharedSessionTree = Arc::new(parking_lot::RwLock::new(SessionTree::new()));
        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(NodeRouter::new(
            tree.clone(),
            registry.clone(),
            sessions.clone(),
            Arc::new(TokenBridge::new(9527)),
            emitter.clone(),
        ));
        Harness {
            router,
            registry,
            connector,
            emitter,
            tree,
            sessions,
        }
    }

    #[tokio::test]
    async fn test_resolve_unknown_and_unbound_nodes() {
        let h = harness(PoolConfig::default());
        assert!(matches!(
            h.router.resolve_connection("missing").await,
            Err(RouteError::NodeNotFound(_))
        ));

        let node = h.router.add_node(None, target("server-a")).unwrap();
        assert!(matches!(
            h.router.resolve_connection(&node).await,
            Err(RouteError::NotConnected(_))
        ));
        let snapshot = h.router.get_node_state(&node).unwrap();
        assert_eq!(snapshot.state.readiness, NodeReadiness::Disconnected);
        assert_eq!(snapshot.generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_node_emits_connecting_then_ready() {
        let h = harness(PoolConfig::default());
        let node = h.router.add_node(None, target("server-a")).unwrap();
        let mut rx = h.emitter.subscribe();

        let conn_id = h.router.connect_node(&node).await.unwrap();
        assert!(h.registry.is_alive(&conn_id));
        assert_eq!(h.emitter.node_ids(&conn_id), vec![node.clone()]);

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| match e {
                NodeStateEvent::ConnectionStateChanged { state, generation, .. } => (state, generation),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            states,
            vec![(NodeReadiness::Connecting, 1), (NodeReadiness::Ready, 2)]
        );

        // 已绑定且可用：直接复用
        assert_eq!(h.router.connect_node(&node).await.unwrap(), conn_id);
        assert_eq!(h.connector.link("server-a").connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_marks_node_error() {
        let h = harness(PoolConfig::default());
        h.connector.link("server-a").reject_auth(true);
        let node = h.router.add_node(None, target("server-a")).unwrap();

        let err = h.router.connect_node(&node).await.unwrap_err();
        assert!(matches!(err, RouteError::ConnectionError(_)));

        let snapshot = h.router.get_node_state(&node).unwrap();
        assert_eq!(snapshot.state.readiness, NodeReadiness::Error);
        assert!(snapshot.state.error.is_some());
        assert_eq!(snapshot.generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_converges_on_one_capability() {
        let h = harness(PoolConfig::default());
        let node = h.router.add_node(None, target("server-a")).unwrap();
        let conn_id = h.router.connect_node(&node).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let router = h.router.clone();
                let node = node.clone();
                tokio::spawn(async move { router.acquire_sftp(&node).await })
            })
            .collect();
        let mut caps = Vec::new();
        for task in tasks {
            caps.push(task.await.unwrap().unwrap());
        }

        assert!(caps.iter().all(|c| Arc::ptr_eq(c, &caps[0])));
        assert_eq!(h.connector.link("server-a").file_transfers_opened(), 1);

        let entry = h.registry.get_connection(&conn_id).unwrap();
        assert_eq!(entry.ref_count(), 1);
        let tree = h.tree.read();
        assert_eq!(
            tree.get_node(&node).unwrap().sftp_session_id.as_deref(),
            Some(entry.file_transfer().slot_id())
        );
        drop(tree);

        let snapshot = h.router.get_node_state(&node).unwrap();
        assert!(snapshot.state.sftp_ready);
        assert_eq!(snapshot.state.sftp_cwd.as_deref(), Some("/home/server-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realpath_rebuilds_broken_channel_once() {
        let h = harness(PoolConfig::default());
        let node = h.router.add_node(None, target("server-a")).unwrap();
        let conn_id = h.router.connect_node(&node).await.unwrap();
        let link = h.connector.link("server-a");

        let first = h.router.acquire_sftp(&node).await.unwrap();
        link.break_file_transfer();

        let path = h.router.node_sftp_realpath(&node, "logs").await.unwrap();
        assert_eq!(path, "/home/server-a/logs");
        assert_eq!(link.file_transfers_opened(), 2);

        let second = h.router.acquire_sftp(&node).await.unwrap();
        assert_eq!(second.slot_id, first.slot_id);
        assert!(second.instance > first.instance);
        // 重建不重复计入引用
        assert_eq!(h.registry.get_connection(&conn_id).unwrap().ref_count(), 1);

        let err = h
            .router
            .node_sftp_realpath(&node, "/missing/file")
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::OperationError(_)));
        assert_eq!(link.file_transfers_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_endpoint_reused_then_rebuilt_after_reconnect() {
        let h = harness(PoolConfig::default());
        let node = h.router.add_node(None, target("server-a")).unwrap();
        let conn_id = h.router.connect_node(&node).await.unwrap();
        let entry = h.registry.get_connection(&conn_id).unwrap();

        let first = h.router.resolve_interactive_endpoint(&node).await.unwrap();
        let again = h.router.resolve_interactive_endpoint(&node).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(entry.ref_count(), 1);
        assert_eq!(entry.terminal_ids(), vec![first.session_id.clone()]);

        let link = h.connector.link("server-a");
        link.kill();
        link.restore();
        h.registry.mark_link_down(&conn_id, "test").await;

        // LinkDown 且有重连任务：等待而不是失败
        let resolved = h.router.resolve_connection(&node).await.unwrap();
        assert_eq!(resolved.connection_id, conn_id);
        assert_eq!(resolved.handle_epoch, 1);

        let mut rx = h.emitter.subscribe();
        let rebuilt = h.router.resolve_interactive_endpoint(&node).await.unwrap();
        assert_ne!(rebuilt.session_id, first.session_id);
        assert_ne!(rebuilt.ws_token, first.ws_token);
        assert_eq!(entry.ref_count(), 1);
        assert_eq!(entry.terminal_ids(), vec![rebuilt.session_id.clone()]);
        assert!(h.sessions.get(&first.session_id).is_none());
        assert_eq!(h.sessions.get(&rebuilt.session_id).unwrap().handle_epoch, 1);

        match rx.try_recv().unwrap() {
            NodeStateEvent::TerminalEndpointChanged { node_id, session_id, .. } => {
                assert_eq!(node_id, node);
                assert_eq!(session_id, rebuilt.session_id);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(h.router.close_terminal(&node).await.unwrap());
        assert!(!h.router.close_terminal(&node).await.unwrap());
        assert_eq!(entry.ref_count(), 0);
        assert_eq!(entry.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_channel_refusal_keeps_node_ready() {
        let h = harness(PoolConfig::default());
        let node = h.router.add_node(None, target("server-a")).unwrap();
        let conn_id = h.router.connect_node(&node).await.unwrap();
        let link = h.connector.link("server-a");

        link.fail_next_session_channels(1);
        let err = h.router.resolve_interactive_endpoint(&node).await.unwrap_err();
        assert!(matches!(err, RouteError::CapabilityUnavailable(_)), "{:?}", err);

        let entry = h.registry.get_connection(&conn_id).unwrap();
        assert_eq!(entry.state(), ConnectionState::Idle);
        assert_eq!(entry.ref_count(), 0);
        let snapshot = h.router.get_node_state(&node).unwrap();
        assert_eq!(snapshot.state.readiness, NodeReadiness::Ready);
        assert!(snapshot.state.ws_endpoint.is_none());

        let endpoint = h.router.resolve_interactive_endpoint(&node).await.unwrap();
        assert_eq!(entry.terminal_ids(), vec![endpoint.session_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cascaded_child_requires_reestablish() {
        let h = harness(PoolConfig::default());
        let jump = h.router.add_node(None, target("jump")).unwrap();
        let db = h.router.add_node(Some(jump.as_str()), target("db")).unwrap();
        let jump_conn = h.router.connect_node(&jump).await.unwrap();
        let db_conn = h.router.connect_node(&db).await.unwrap();

        let db_entry = h.registry.get_connection(&db_conn).unwrap();
        assert_eq!(db_entry.parent_connection_id(), Some(jump_conn.as_str()));

        let link = h.connector.link("jump");
        link.kill();
        h.registry.mark_link_down(&jump_conn, "test").await;

        assert_eq!(db_entry.state(), ConnectionState::LinkDown);
        assert!(matches!(
            h.router.resolve_connection(&db).await,
            Err(RouteError::NotConnected(_))
        ));
        let snapshot = h.router.get_node_state(&db).unwrap();
        assert_eq!(snapshot.state.readiness, NodeReadiness::Connecting);
        assert!(snapshot.state.error.is_none());

        // 父连接恢复后子节点原位重建
        link.restore();
        h.router.resolve_connection(&jump).await.unwrap();
        assert_eq!(h.router.reconnect_node(&db).await.unwrap(), db_conn);
        assert_eq!(db_entry.state(), ConnectionState::Idle);
        assert_eq!(db_entry.handle_epoch(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_times_out() {
        let config = PoolConfig {
            connect_wait_timeout_secs: 3,
            ..PoolConfig::default()
        };
        let h = harness(config);
        let node = h.router.add_node(None, target("server-a")).unwrap();
        let conn_id = h.router.connect_node(&node).await.unwrap();

        h.connector.link("server-a").kill();
        h.registry.mark_link_down(&conn_id, "test").await;

        let started = tokio::time::Instant::now();
        assert!(matches!(
            h.router.resolve_connection(&node).await,
            Err(RouteError::ConnectionTimeout(_))
        ));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(h.registry.has_reconnect_job(&conn_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_node_closes_unshared_connection() {
        let h = harness(PoolConfig::default());
        let a = h.router.add_node(None, target("server-a")).unwrap();
        let b = h.router.add_node(None, target("server-a")).unwrap();
        let conn_a = h.router.connect_node(&a).await.unwrap();
        let conn_b = h.router.connect_node(&b).await.unwrap();
        // 同目标复用同一条连接
        assert_eq!(conn_a, conn_b);
        h.router.resolve_interactive_endpoint(&a).await.unwrap();

        h.router.disconnect_node(&a).await.unwrap();
        assert!(h.registry.is_alive(&conn_a));
        assert_eq!(h.sessions.count(), 0);
        assert_eq!(
            h.router.get_node_state(&a).unwrap().state.readiness,
            NodeReadiness::Disconnected
        );

        h.router.disconnect_node(&b).await.unwrap();
        assert!(h.registry.get_connection(&conn_a).is_none());

        let removed = h.router.remove_node(&a).await.unwrap();
        assert_eq!(removed, vec![a.clone()]);
        assert_eq!(h.router.sequencer().current(&a), 0);
    }

    #[test]
    fn test_snapshot_aligns_with_concurrent_events() {
        const EVENTS: u64 = 400;

        let h = harness(PoolConfig::default());
        let node = h.router.add_node(None, target("server-a")).unwrap();

        let writer = {
            let tree = h.tree.clone();
            let emitter = h.emitter.clone();
            let node = node.clone();
            std::thread::spawn(move || {
                for i in 0..EVENTS {
                    let (tree_state, readiness) = if i % 2 == 0 {
                        (TreeNodeState::Connecting, NodeReadiness::Connecting)
                    } else {
                        (TreeNodeState::Connected, NodeReadiness::Ready)
                    };
                    tree.write().update_state(&node, tree_state).unwrap();
                    emitter.emit_node_state(&node, readiness, "tick");
                }
            })
        };

        std::thread::yield_now();
        let (mut rx, snapshot) = h.router.subscribe_with_snapshot(&node).unwrap();
        writer.join().unwrap();

        let mut mark = GenerationWatermark::from_snapshot(snapshot.generation);
        let mut accepted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if mark.accept(event.generation()) {
                accepted.push(event.generation());
            }
        }

        let expected: Vec<u64> = (snapshot.generation + 1..=EVENTS).collect();
        assert_eq!(accepted, expected);
        assert_eq!(h.router.sequencer().current(&node), EVENTS);
        // 最后一个事件是 Ready
        assert_eq!(
            h.router.get_node_state(&node).unwrap().state.readiness,
            NodeReadiness::Ready
        );
    }
}
