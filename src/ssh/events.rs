//! 连接池级事件（面向连接监控面板，按 connectionId 寻址）
//!
//! 节点级消费者应使用 `NodeStateEvent`；这里的事件不带 generation。

use serde::Serialize;

/// 连接池事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// 连接状态变更（link_down 时附带受影响的后代连接）
    StatusChanged {
        connection_id: String,
        status: String,
        affected_children: Vec<String>,
        timestamp: u64,
    },

    /// 重连进度（一次尝试失败后，下一次尝试之前发送）
    ReconnectProgress {
        connection_id: String,
        attempt: u32,
        max_attempts: u32,
        next_retry_ms: u64,
        timestamp: u64,
    },

    /// 重连成功，附带需要恢复的终端与转发
    Reconnected {
        connection_id: String,
        terminal_ids: Vec<String>,
        forward_ids: Vec<String>,
    },

    /// 连接已销毁
    Closed { connection_id: String, reason: String },
}

impl PoolEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            PoolEvent::StatusChanged { connection_id, .. }
            | PoolEvent::ReconnectProgress { connection_id, .. }
            | PoolEvent::Reconnected { connection_id, .. }
            | PoolEvent::Closed { connection_id, .. } => connection_id,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
