//! NodeEventSequencer - generation 管理
//!
//! 每个节点维护一个独立的单调递增计数器，用于事件有序性保证。

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// 节点事件序列器：为每个节点维护独立的 generation 计数器。
///
/// 用于：
/// - emit 事件时获取递增的 generation 值
/// - 订阅方初始化时获取当前 generation 与快照对齐
///
/// 线程安全：DashMap + AtomicU64，无锁递增。
pub struct NodeEventSequencer {
    counters: DashMap<String, AtomicU64>,
}

impl NodeEventSequencer {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// 获取下一个 generation（原子递增），用于 emit 事件。
    pub fn next(&self, node_id: &str) -> u64 {
        self.counters
            .entry(node_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1 // 从 1 开始，0 保留给"未初始化"
    }

    /// 获取当前 generation（不递增），用于快照查询。
    pub fn current(&self, node_id: &str) -> u64 {
        self.counters
            .get(node_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// 移除节点的计数器（节点永久删除时调用）。
    pub fn remove(&self, node_id: &str) {
        self.counters.remove(node_id);
    }
}

impl Default for NodeEventSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// 订阅方的水位线：只接受严格大于已见最大 generation 的事件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationWatermark {
    seen: u64,
}

impl GenerationWatermark {
    /// 从快照的 generation 初始化
    pub fn from_snapshot(generation: u64) -> Self {
        Self { seen: generation }
    }

    /// 事件应被采纳时返回 true 并推进水位
    pub fn accept(&mut self, generation: u64) -> bool {
        if generation <= self.seen {
            return false;
        }
        self.seen = generation;
        true
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}
