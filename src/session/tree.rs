//! Session Tree - 逻辑节点存储
//!
//! 节点 ID 在整个生命周期内稳定；节点背后的 SSH 连接、终端会话、
//! 文件传输槽位都可以被替换而节点 ID 不变。
//!
//! ```text
//! SessionTree
//!   ├── jump-01            (ssh_connection_id = c1)
//!   │     └── bastion      (ssh_connection_id = c2, 经 c1 隧道)
//!   │           └── db     (ssh_connection_id = c3, 经 c2 隧道)
//!   └── server-a           (ssh_connection_id = c4)
//! ```

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::ssh::ConnectTarget;

/// 会话节点 - 树的基本单元
#[derive(Debug, Clone)]
pub struct SessionNode {
    /// 唯一标识
    pub id: String,

    /// 父节点 ID（None = 直连本地）
    pub parent_id: Option<String>,

    /// 子节点 ID 列表
    pub children_ids: Vec<String>,

    /// 树深度（0 = 直连，1 = 一级跳板，...）
    pub depth: u32,

    /// 连接目标
    pub connection: ConnectTarget,

    /// 节点状态
    pub state: NodeState,

    /// 关联的终端会话 ID
    pub terminal_session_id: Option<String>,

    /// 关联的文件传输槽位 ID
    pub sftp_session_id: Option<String>,

    /// 关联的 SSH 连接 ID（来自 SshConnectionRegistry）
    pub ssh_connection_id: Option<String>,

    /// 创建时间
    pub created_at: chrono::DateTime<Utc>,
}

impl SessionNode {
    fn new(connection: ConnectTarget, parent_id: Option<String>, depth: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            children_ids: Vec::new(),
            depth,
            connection,
            state: NodeState::Pending,
            terminal_session_id: None,
            sftp_session_id: None,
            ssh_connection_id: None,
            created_at: Utc::now(),
        }
    }
}

/// 节点状态（树自身的粗粒度状态，连接细节看 ConnectionEntry）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeState {
    /// 未连接
    Pending,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 连接断开，可重连
    Disconnected,
    /// 连接失败
    Failed { error: String },
}

/// 会话树 - 管理所有会话节点
#[derive(Default)]
pub struct SessionTree {
    /// 所有节点（ID -> Node）
    nodes: HashMap<String, SessionNode>,
}

impl SessionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get_node(&self, id: &str) -> Option<&SessionNode> {
        self.nodes.get(id)
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut SessionNode> {
        self.nodes.get_mut(id)
    }

    /// 添加直连节点（depth=0）
    pub fn add_root_node(&mut self, connection: ConnectTarget) -> String {
        let node = SessionNode::new(connection, None, 0);
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        id
    }

    /// 在父节点下添加子节点（经父节点连接的隧道到达）
    pub fn drill_down(
        &mut self,
        parent_id: &str,
        connection: ConnectTarget,
    ) -> Result<String, TreeError> {
        let parent = self
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| TreeError::NodeNotFound(parent_id.to_string()))?;

        let node = SessionNode::new(connection, Some(parent_id.to_string()), parent.depth + 1);
        let id = node.id.clone();
        parent.children_ids.push(id.clone());
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    pub fn update_state(&mut self, node_id: &str, new_state: NodeState) -> Result<(), TreeError> {
        self.node_mut(node_id)?.state = new_state;
        Ok(())
    }

    /// 关联 / 清除 SSH 连接 ID
    pub fn set_ssh_connection_id(
        &mut self,
        node_id: &str,
        connection_id: Option<String>,
    ) -> Result<(), TreeError> {
        self.node_mut(node_id)?.ssh_connection_id = connection_id;
        Ok(())
    }

    pub fn set_terminal_session_id(
        &mut self,
        node_id: &str,
        session_id: Option<String>,
    ) -> Result<(), TreeError> {
        self.node_mut(node_id)?.terminal_session_id = session_id;
        Ok(())
    }

    pub fn set_sftp_session_id(
        &mut self,
        node_id: &str,
        session_id: Option<String>,
    ) -> Result<(), TreeError> {
        self.node_mut(node_id)?.sftp_session_id = session_id;
        Ok(())
    }

    /// 绑定到某个连接的所有节点
    pub fn nodes_for_connection(&self, connection_id: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.ssh_connection_id.as_deref() == Some(connection_id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// 移除节点（递归移除所有子节点）
    pub fn remove_node(&mut self, node_id: &str) -> Result<Vec<String>, TreeError> {
        let mut removed_ids = Vec::new();
        self.remove_node_recursive(node_id, &mut removed_ids)?;
        Ok(removed_ids)
    }

    fn remove_node_recursive(
        &mut self,
        node_id: &str,
        removed_ids: &mut Vec<String>,
    ) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;

        let children_ids = node.children_ids.clone();
        let parent_id = node.parent_id.clone();

        for child_id in children_ids {
            self.remove_node_recursive(&child_id, removed_ids)?;
        }

        if let Some(parent) = parent_id.and_then(|pid| self.nodes.get_mut(&pid)) {
            parent.children_ids.retain(|id| id != node_id);
        }

        self.nodes.remove(node_id);
        removed_ids.push(node_id.to_string());
        Ok(())
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut SessionNode, TreeError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))
    }
}

/// 会话树错误
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

}
