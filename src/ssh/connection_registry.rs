//! SSH Connection Registry
//!
//! 独立的 SSH 连接池管理，与节点 / 前端完全解耦。
//!
//! # 架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SshConnectionRegistry                                       │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  ConnectionEntry                                        │  │
//! │  │  ├── handle: RwLock<HandleController> + handle_epoch    │  │
//! │  │  ├── state: watch::Sender<ConnectionState>              │  │
//! │  │  ├── ref_count: AtomicU32                               │  │
//! │  │  ├── file_transfer: FileTransferSlot                    │  │
//! │  │  └── idle_timer / heartbeat_task                        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │
//!          │  HandleController (clone)
//!          │
//!    ┌─────┴─────┬─────────────┬─────────────┐
//!    ▼           ▼             ▼             ▼
//! Terminal   Terminal      SFTP       Forwarding / Tunnel
//!  Node 1     Node 2
//! ```
//!
//! # 空闲超时策略
//!
//! - 引用计数归零时，启动空闲计时器（默认 30 分钟）
//! - 计时器到期前有新使用者：取消计时器，复用连接
//! - 计时器到期：断开连接，释放资源
//! - keep_alive=true：忽略空闲超时
//!
//! # 锁约定
//!
//! 状态切换与对应事件发射都在条目的 `transition_lock` 内完成。
//! 持有一个条目的 transition lock 时不得再获取另一个条目的。

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ConnectTarget;
use super::error::SshError;
use super::events::{now_millis, PoolEvent};
use super::file_transfer::{AcquireOutcome, CapabilityHandle, FileTransferSlot};
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::reconnect::ReconnectOrchestrator;
use super::transport::{Connector, TunnelIo};
use crate::config::PoolConfig;
use crate::router::{NodeEventEmitter, NodeReadiness};

/// 连接池事件广播容量
const POOL_EVENT_CAPACITY: usize = 256;

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 连接中
    Connecting,
    /// 已连接，有活跃使用者
    Active,
    /// 已连接，无使用者，等待超时
    Idle,
    /// 链路断开（心跳失败），等待重连
    LinkDown,
    /// 正在重连
    Reconnecting,
    /// 正在断开
    Disconnecting,
    /// 已断开
    Disconnected,
    /// 连接错误
    Error(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Idle => "idle",
            ConnectionState::LinkDown => "link_down",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error(_) => "error",
        }
    }

    /// 终态：不允许再切换
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error(_))
    }

    /// 可直接使用（打开 channel / 复用）
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::Idle)
    }

    /// 状态机合法性检查（相同状态视为合法的 no-op）
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (_, Error(_))
                | (_, Disconnecting)
                | (Connecting | LinkDown | Reconnecting | Disconnecting, Disconnected)
                | (Connecting, Active | Idle)
                | (Active, Idle)
                | (Idle, Active)
                | (Active | Idle, LinkDown)
                | (LinkDown, Reconnecting)
                // 级联时子连接自己的重连任务被叫停，回到 LinkDown 等待父连接
                | (Reconnecting, Active | Idle | LinkDown)
        )
    }
}

/// SSH 连接信息（用于监控显示）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub ref_count: u32,
    pub keep_alive: bool,
    pub handle_epoch: u64,
    pub created_at: String,
    pub last_active: String,
    /// 关联的 session IDs
    pub terminal_ids: Vec<String>,
    /// 文件传输槽位 ID（就绪时）
    pub sftp_session_id: Option<String>,
    /// 关联的 forward IDs
    pub forward_ids: Vec<String>,
    /// 父连接 ID（隧道连接时非空）
    pub parent_connection_id: Option<String>,
}

/// 连接池统计信息（用于监控面板）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolStats {
    /// 总连接数
    pub total_connections: usize,
    /// 活跃连接数（有终端/SFTP/转发在用）
    pub active_connections: usize,
    /// 空闲连接数（无使用者，等待超时）
    pub idle_connections: usize,
    /// 重连中的连接数
    pub reconnecting_connections: usize,
    /// 链路断开的连接数（等待重连）
    pub link_down_connections: usize,
    /// 总终端数
    pub total_terminals: usize,
    /// 总 SFTP 会话数
    pub total_sftp_sessions: usize,
    /// 总端口转发数
    pub total_forwards: usize,
    /// 总引用计数
    pub total_ref_count: u32,
    /// 连接池容量（0 = 无限制）
    pub pool_capacity: usize,
    /// 空闲超时时间（秒）
    pub idle_timeout_secs: u64,
}

/// SSH 连接注册表错误
#[derive(Debug, thiserror::Error)]
pub enum ConnectionRegistryError {
    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Connection limit reached: {current}/{max}")]
    LimitReached { current: usize, max: usize },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Already disconnected")]
    AlreadyDisconnected,

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Parent connection unavailable: {0}")]
    ParentUnavailable(String),

    #[error("Capability failed: {0}")]
    CapabilityFailed(String),
}

impl From<SshError> for ConnectionRegistryError {
    fn from(err: SshError) -> Self {
        if err.is_fatal() {
            ConnectionRegistryError::AuthenticationFailed(err.to_string())
        } else {
            ConnectionRegistryError::ConnectionFailed(err.to_string())
        }
    }
}

impl Serialize for ConnectionRegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// 单个 SSH 连接条目
pub struct ConnectionEntry {
    /// 连接唯一 ID
    pub id: String,

    /// 连接目标（含凭据，重连时复用）
    pub target: ConnectTarget,

    /// Handle 控制器，重连时原位替换
    handle: parking_lot::RwLock<HandleController>,

    /// 每次替换 handle +1
    handle_epoch: AtomicU64,

    /// 连接状态（watch：同步读取 + 异步等待）
    state: watch::Sender<ConnectionState>,

    /// 状态切换锁
    transition_lock: Mutex<()>,

    /// 已进入关闭流程
    closing: AtomicBool,

    /// 引用计数（Terminal + SFTP + Forwarding + 隧道子连接）
    ref_count: AtomicU32,

    /// 最后活动时间戳（Unix 时间戳，秒）
    last_active: AtomicI64,

    /// 是否保持连接（用户设置）
    keep_alive: AtomicBool,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 空闲计时器句柄（用于取消）
    idle_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,

    /// 心跳任务句柄
    heartbeat_task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    /// 连续心跳失败次数
    heartbeat_failures: AtomicU32,

    /// 关联的 terminal session IDs
    terminal_ids: parking_lot::RwLock<Vec<String>>,

    /// 关联的 forward IDs
    forward_ids: parking_lot::RwLock<Vec<String>>,

    /// 文件传输能力（至多一个）
    file_transfer: FileTransferSlot,

    /// 父连接 ID（用于隧道连接，通过父连接的 direct-tcpip 建立）
    /// None = 直连本地
    /// Some(id) = 通过父连接的隧道建立
    parent_connection_id: Option<String>,
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("target", &self.target.key())
            .field("state", &self.state())
            .field("handle_epoch", &self.handle_epoch())
            .field("ref_count", &self.ref_count())
            .field("parent_connection_id", &self.parent_connection_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionEntry {
    pub(crate) fn new(
        id: String,
        target: ConnectTarget,
        handle: HandleController,
        parent_connection_id: Option<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            id,
            target,
            handle: parking_lot::RwLock::new(handle),
            handle_epoch: AtomicU64::new(0),
            state,
            transition_lock: Mutex::new(()),
            closing: AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
            last_active: AtomicI64::new(Utc::now().timestamp()),
            keep_alive: AtomicBool::new(false),
            created_at: Utc::now(),
            idle_timer: parking_lot::Mutex::new(None),
            heartbeat_task: parking_lot::Mutex::new(None),
            heartbeat_failures: AtomicU32::new(0),
            terminal_ids: parking_lot::RwLock::new(Vec::new()),
            forward_ids: parking_lot::RwLock::new(Vec::new()),
            file_transfer: FileTransferSlot::new(),
            parent_connection_id,
        }
    }

    // ========================================================================
    // Handle
    // ========================================================================

    /// 当前 handle 控制器（克隆）。不要跨重连缓存。
    pub fn handle(&self) -> HandleController {
        self.handle.read().clone()
    }

    pub fn handle_epoch(&self) -> u64 {
        self.handle_epoch.load(Ordering::SeqCst)
    }

    /// 同一把读锁下取 handle 和 epoch，两者总是配对的
    pub fn handle_with_epoch(&self) -> (HandleController, u64) {
        let guard = self.handle.read();
        (guard.clone(), self.handle_epoch.load(Ordering::SeqCst))
    }

    /// 原子替换 handle，返回旧 handle 与新 epoch
    pub(crate) fn swap_handle(&self, next: HandleController) -> (HandleController, u64) {
        let mut guard = self.handle.write();
        let old = std::mem::replace(&mut *guard, next);
        let epoch = self.handle_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        (old, epoch)
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 切换状态，返回切换前的状态（未变化时为 None）
    ///
    /// 调用方应持有 transition lock。
    pub(crate) fn set_state(
        &self,
        next: ConnectionState,
    ) -> Result<Option<ConnectionState>, ConnectionRegistryError> {
        let mut outcome = Ok(None);
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                outcome = Err(ConnectionRegistryError::InvalidState(format!(
                    "{} -> {} for connection {}",
                    current.as_str(),
                    next.as_str(),
                    self.id
                )));
                return false;
            }
            outcome = Ok(Some(std::mem::replace(current, next)));
            true
        });
        outcome
    }

    pub(crate) async fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transition_lock.lock().await
    }

    /// 标记进入关闭流程，已在关闭中返回 false
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// 可复用：Active/Idle 且心跳无失败
    pub fn is_reusable(&self) -> bool {
        !self.is_closing() && self.state().is_usable() && self.heartbeat_failures() == 0
    }

    // ========================================================================
    // Ref counting
    // ========================================================================

    /// 增加引用计数
    pub(crate) fn add_ref(&self) -> u32 {
        let current = self.ref_count.load(Ordering::SeqCst);
        // 防止溢出
        if current >= u32::MAX - 1 {
            warn!("Connection {} ref count at maximum, not incrementing", self.id);
            return current;
        }
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        debug!("Connection {} ref count increased to {}", self.id, count);
        self.update_activity();
        count
    }

    /// 减少引用计数
    pub(crate) fn release(&self) -> u32 {
        let current = self.ref_count.load(Ordering::SeqCst);
        // 防止下溢
        if current == 0 {
            warn!("Connection {} ref count already 0, not decrementing", self.id);
            return 0;
        }
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        let count = prev.saturating_sub(1);
        debug!("Connection {} ref count decreased to {}", self.id, count);
        self.update_activity();
        count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn update_activity(&self) {
        self.last_active.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    fn set_keep_alive_flag(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::SeqCst);
    }

    // ========================================================================
    // Timers / tasks
    // ========================================================================

    pub(crate) fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
            debug!("Connection {} idle timer cancelled", self.id);
        }
    }

    pub(crate) fn set_idle_timer(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.idle_timer.lock().replace(handle) {
            old.abort();
        }
    }

    /// 计时器任务自身调用：取走句柄但不 abort
    pub(crate) fn detach_idle_timer(&self) {
        self.idle_timer.lock().take();
    }

    pub fn has_idle_timer(&self) -> bool {
        self.idle_timer
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub(crate) fn cancel_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
            debug!("Connection {} heartbeat cancelled", self.id);
        }
    }

    pub(crate) fn set_heartbeat_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.heartbeat_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// 心跳任务自身调用：取走句柄但不 abort
    pub(crate) fn detach_heartbeat(&self) {
        self.heartbeat_task.lock().take();
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat_task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn reset_heartbeat_failures(&self) {
        self.heartbeat_failures.store(0, Ordering::SeqCst);
    }

    pub fn increment_heartbeat_failures(&self) -> u32 {
        self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn heartbeat_failures(&self) -> u32 {
        self.heartbeat_failures.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Dependents
    // ========================================================================

    fn push_terminal(&self, session_id: &str) -> bool {
        let mut ids = self.terminal_ids.write();
        if ids.iter().any(|id| id == session_id) {
            return false;
        }
        ids.push(session_id.to_string());
        true
    }

    fn take_terminal(&self, session_id: &str) -> bool {
        let mut ids = self.terminal_ids.write();
        let before = ids.len();
        ids.retain(|id| id != session_id);
        ids.len() != before
    }

    pub fn terminal_ids(&self) -> Vec<String> {
        self.terminal_ids.read().clone()
    }

    fn push_forward(&self, forward_id: &str) -> bool {
        let mut ids = self.forward_ids.write();
        if ids.iter().any(|id| id == forward_id) {
            return false;
        }
        ids.push(forward_id.to_string());
        true
    }

    fn take_forward(&self, forward_id: &str) -> bool {
        let mut ids = self.forward_ids.write();
        let before = ids.len();
        ids.retain(|id| id != forward_id);
        ids.len() != before
    }

    pub fn forward_ids(&self) -> Vec<String> {
        self.forward_ids.read().clone()
    }

    pub fn parent_connection_id(&self) -> Option<&str> {
        self.parent_connection_id.as_deref()
    }

    // ========================================================================
    // File transfer
    // ========================================================================

    pub fn file_transfer(&self) -> &FileTransferSlot {
        &self.file_transfer
    }

    /// 文件传输就绪时返回 cwd（同步读取）
    pub fn sftp_status(&self) -> Option<String> {
        self.file_transfer.status()
    }

    /// 获取或创建文件传输能力（唯一创建路径）
    ///
    /// 槽位 epoch 与当前 handle 不一致时原位重建。引用计数由
    /// `SshConnectionRegistry::acquire_file_transfer` 负责。
    pub async fn acquire_file_transfer(
        &self,
    ) -> Result<(CapabilityHandle, AcquireOutcome), SshError> {
        let (handle, epoch) = self.handle_with_epoch();
        self.file_transfer.acquire(epoch, &handle).await
    }

    pub fn to_info(&self) -> ConnectionInfo {
        let format_ts = |ts: i64| {
            DateTime::<Utc>::from_timestamp(ts, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        };
        ConnectionInfo {
            id: self.id.clone(),
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            state: self.state(),
            ref_count: self.ref_count(),
            keep_alive: self.is_keep_alive(),
            handle_epoch: self.handle_epoch(),
            created_at: self.created_at.to_rfc3339(),
            last_active: format_ts(self.last_active()),
            terminal_ids: self.terminal_ids(),
            sftp_session_id: self
                .sftp_status()
                .map(|_| self.file_transfer.slot_id().to_string()),
            forward_ids: self.forward_ids(),
            parent_connection_id: self.parent_connection_id.clone(),
        }
    }
}

/// SSH 连接注册表
pub struct SshConnectionRegistry {
    /// 所有活跃的 SSH 连接
    pub(super) connections: DashMap<String, Arc<ConnectionEntry>>,

    /// 按复用 key 的建连闸门，同 key 并发 resolve 共享一次建连
    connecting: DashMap<String, Arc<Mutex<()>>>,

    /// 连接池配置
    config: parking_lot::RwLock<PoolConfig>,

    pub(super) connector: Arc<dyn Connector>,

    /// 节点事件（connectionId → nodeId 映射在 emitter 内）
    pub(super) emitter: Arc<NodeEventEmitter>,

    pool_events: broadcast::Sender<PoolEvent>,

    pub(super) reconnects: ReconnectOrchestrator,
}

impl SshConnectionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        emitter: Arc<NodeEventEmitter>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let (pool_events, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        Arc::new(Self {
            connections: DashMap::new(),
            connecting: DashMap::new(),
            config: parking_lot::RwLock::new(config),
            connector,
            emitter,
            pool_events,
            reconnects: ReconnectOrchestrator::new(),
        })
    }

    /// 获取配置
    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    /// 更新配置（对之后启动的计时器 / 心跳 / 重连生效）
    pub fn set_config(&self, config: PoolConfig) {
        *self.config.write() = config;
    }

    pub fn emitter(&self) -> &Arc<NodeEventEmitter> {
        &self.emitter
    }

    pub fn subscribe_pool_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool_events.subscribe()
    }

    pub(super) fn publish(&self, event: PoolEvent) {
        // 没有订阅者时 send 返回 Err，忽略
        let _ = self.pool_events.send(event);
    }

    pub(super) fn publish_status(&self, conn: &ConnectionEntry, affected_children: Vec<String>) {
        self.publish(PoolEvent::StatusChanged {
            connection_id: conn.id.clone(),
            status: conn.state().as_str().to_string(),
            affected_children,
            timestamp: now_millis(),
        });
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections.get(connection_id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_alive(&self, connection_id: &str) -> bool {
        self.get_connection(connection_id)
            .map(|c| c.state().is_usable())
            .unwrap_or(false)
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// 获取 transition lock 后切换状态并发出事件
    pub(super) async fn transition(
        &self,
        conn: &ConnectionEntry,
        next: ConnectionState,
        reason: &str,
    ) -> Result<bool, ConnectionRegistryError> {
        let _guard = conn.lock_transitions().await;
        self.transition_locked(conn, next, reason, Vec::new())
    }

    /// 已持有 transition lock 时使用
    pub(super) fn transition_locked(
        &self,
        conn: &ConnectionEntry,
        next: ConnectionState,
        reason: &str,
        affected_children: Vec<String>,
    ) -> Result<bool, ConnectionRegistryError> {
        match conn.set_state(next)? {
            Some(prev) => {
                let current = conn.state();
                debug!(
                    "Connection {} state {} -> {} ({})",
                    conn.id,
                    prev.as_str(),
                    current.as_str(),
                    reason
                );
                self.emitter
                    .emit_transition(&conn.id, &prev, &current, reason);
                self.publish_status(conn, affected_children);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // Resolve / create
    // ========================================================================

    /// 获取一条到 `target` 的健康连接，没有则新建
    pub async fn resolve(
        self: &Arc<Self>,
        target: &ConnectTarget,
    ) -> Result<Arc<ConnectionEntry>, ConnectionRegistryError> {
        self.resolve_with_parent(None, target).await
    }

    /// 通过父连接的 direct-tcpip 通道获取 / 建立隧道连接
    pub async fn resolve_tunneled(
        self: &Arc<Self>,
        parent_connection_id: &str,
        target: &ConnectTarget,
    ) -> Result<Arc<ConnectionEntry>, ConnectionRegistryError> {
        self.resolve_with_parent(Some(parent_connection_id), target)
            .await
    }

    async fn resolve_with_parent(
        self: &Arc<Self>,
        parent_id: Option<&str>,
        target: &ConnectTarget,
    ) -> Result<Arc<ConnectionEntry>, ConnectionRegistryError> {
        if let Some(existing) = self.find_reusable(parent_id, target) {
            debug!("Reusing connection {} for {}", existing.id, target.key());
            return Ok(existing);
        }

        let key = match parent_id {
            Some(pid) => format!("{}>{}", pid, target.key()),
            None => target.key(),
        };
        let gate = self
            .connecting
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _in_flight = gate.lock().await;
            // 等待期间可能已有其他调用者建好
            match self.find_reusable(parent_id, target) {
                Some(existing) => {
                    debug!(
                        "Connection {} became available while waiting for {}",
                        existing.id, key
                    );
                    Ok(existing)
                }
                None => self.establish(parent_id, target).await,
            }
        };

        // map 自身 + 本调用者之外没人持有闸门时移除
        self.connecting
            .remove_if(&key, |_, g| Arc::strong_count(g) <= 2);
        result
    }

    /// 查找可复用的连接（相同端点与父连接、认证兼容、健康）
    pub fn find_reusable(
        &self,
        parent_id: Option<&str>,
        target: &ConnectTarget,
    ) -> Option<Arc<ConnectionEntry>> {
        self.connections
            .iter()
            .filter(|e| {
                let conn = e.value();
                conn.parent_connection_id() == parent_id
                    && conn.target.same_endpoint(target)
                    && conn.target.auth.compatible_with(&target.auth)
                    && conn.is_reusable()
            })
            .map(|e| e.value().clone())
            .next()
    }

    async fn establish(
        self: &Arc<Self>,
        parent_id: Option<&str>,
        target: &ConnectTarget,
    ) -> Result<Arc<ConnectionEntry>, ConnectionRegistryError> {
        // 检查连接数限制
        let config = self.config();
        if config.max_connections > 0 && self.connections.len() >= config.max_connections {
            return Err(ConnectionRegistryError::LimitReached {
                current: self.connections.len(),
                max: config.max_connections,
            });
        }

        let tunnel = match parent_id {
            Some(pid) => Some(self.open_tunnel(pid, target).await?),
            None => None,
        };

        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating SSH connection {} -> {}{}",
            connection_id,
            target.key(),
            parent_id
                .map(|p| format!(" (via {})", p))
                .unwrap_or_default()
        );

        let timeout = config.connect_timeout();
        let handle = match tokio::time::timeout(timeout, self.connector.connect(target, tunnel)).await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!("Connection {} to {} failed: {}", connection_id, target.key(), e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Connection {} to {} timed out", connection_id, target.key());
                return Err(ConnectionRegistryError::ConnectionFailed(format!(
                    "connect to {} timed out after {:?}",
                    target.key(),
                    timeout
                )));
            }
        };

        let controller = spawn_handle_owner_task(handle, connection_id.clone());
        let entry = Arc::new(ConnectionEntry::new(
            connection_id.clone(),
            target.clone(),
            controller,
            parent_id.map(str::to_string),
        ));

        // 子连接持有父连接一个引用
        if let Some(pid) = parent_id {
            if let Err(e) = self.add_ref(pid).await {
                entry.handle().disconnect().await;
                return Err(ConnectionRegistryError::ParentUnavailable(format!(
                    "{}: {}",
                    pid, e
                )));
            }
        }

        self.connections
            .insert(connection_id.clone(), entry.clone());

        {
            let _guard = entry.lock_transitions().await;
            self.transition_locked(&entry, ConnectionState::Idle, "connected", Vec::new())?;
        }
        self.start_idle_timer(&entry);
        self.start_heartbeat(&connection_id);

        info!("Connection {} established", connection_id);
        Ok(entry)
    }

    /// 在父连接上打开 direct-tcpip 通道作为隧道
    pub(super) async fn open_tunnel(
        &self,
        parent_id: &str,
        target: &ConnectTarget,
    ) -> Result<Box<dyn TunnelIo>, ConnectionRegistryError> {
        let parent = self
            .get_connection(parent_id)
            .ok_or_else(|| ConnectionRegistryError::ParentUnavailable(parent_id.to_string()))?;

        let state = parent.state();
        if !state.is_usable() || parent.is_closing() {
            return Err(ConnectionRegistryError::ParentUnavailable(format!(
                "{} is {}",
                parent_id,
                state.as_str()
            )));
        }

        let channel = parent
            .handle()
            .open_direct_tcpip(&target.host, target.port)
            .await
            .map_err(|e| ConnectionRegistryError::ParentUnavailable(format!("{}: {}", parent_id, e)))?;

        channel.into_io().ok_or_else(|| {
            ConnectionRegistryError::ConnectionFailed("direct-tcpip channel has no stream".into())
        })
    }

    // ========================================================================
    // Ref counting & idle timer
    // ========================================================================

    /// 增加引用计数；取消空闲计时器，Idle → Active
    pub async fn add_ref(
        self: &Arc<Self>,
        connection_id: &str,
    ) -> Result<u32, ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        let _guard = conn.lock_transitions().await;

        // 与空闲回收竞争：回收先拿到锁则失败
        if conn.is_closing() || conn.state().is_terminal() {
            return Err(ConnectionRegistryError::AlreadyDisconnected);
        }

        let count = conn.add_ref();
        conn.cancel_idle_timer();

        if conn.state() == ConnectionState::Idle {
            self.transition_locked(&conn, ConnectionState::Active, "acquired", Vec::new())?;
            info!("Connection {} reactivated (ref_count -> {})", connection_id, count);
        }

        Ok(count)
    }

    /// 减少引用计数；归零时 Active → Idle 并启动空闲计时器
    pub async fn release(
        self: &Arc<Self>,
        connection_id: &str,
    ) -> Result<u32, ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        let _guard = conn.lock_transitions().await;
        let count = conn.release();

        if count == 0 && !conn.is_closing() {
            if conn.state() == ConnectionState::Active {
                self.transition_locked(&conn, ConnectionState::Idle, "released", Vec::new())?;
            }
            if conn.state() == ConnectionState::Idle {
                self.start_idle_timer(&conn);
            }
        }

        Ok(count)
    }

    /// 启动空闲计时器（keep_alive 或仍有引用时不启动）
    pub(super) fn start_idle_timer(self: &Arc<Self>, conn: &Arc<ConnectionEntry>) {
        if conn.is_keep_alive() {
            info!(
                "Connection {} idle but keep_alive=true, not starting timer",
                conn.id
            );
            return;
        }
        if conn.ref_count() > 0 {
            return;
        }

        let timeout = self.config().idle_timeout();
        info!(
            "Connection {} idle, starting {}s timer",
            conn.id,
            timeout.as_secs()
        );

        let registry = Arc::downgrade(self);
        let connection_id = conn.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.evict_idle(&connection_id).await;
            }
        });
        conn.set_idle_timer(handle);
    }

    /// 空闲计时器到期
    async fn evict_idle(self: &Arc<Self>, connection_id: &str) {
        let Some(conn) = self.get_connection(connection_id) else {
            return;
        };

        {
            let _guard = conn.lock_transitions().await;
            conn.detach_idle_timer();

            if conn.ref_count() > 0
                || conn.is_keep_alive()
                || conn.state() != ConnectionState::Idle
            {
                debug!(
                    "Connection {} idle timer expired but connection in use, ignoring",
                    connection_id
                );
                return;
            }
            if !conn.begin_close() {
                return;
            }
            let _ = conn.set_state(ConnectionState::Disconnecting);
        }

        info!(
            "Connection {} idle timeout expired, disconnecting",
            connection_id
        );
        self.finish_close(&conn, "idle_timeout").await;
    }

    /// 设置 keep_alive：true 取消计时器，false 且空闲时重启计时器
    pub async fn set_keep_alive(
        self: &Arc<Self>,
        connection_id: &str,
        keep_alive: bool,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        let _guard = conn.lock_transitions().await;
        conn.set_keep_alive_flag(keep_alive);

        if keep_alive {
            conn.cancel_idle_timer();
        } else if conn.state() == ConnectionState::Idle && !conn.is_closing() {
            self.start_idle_timer(&conn);
        }

        info!("Connection {} keep_alive set to {}", connection_id, keep_alive);
        Ok(())
    }

    // ========================================================================
    // Dependents
    // ========================================================================

    pub async fn add_terminal(
        self: &Arc<Self>,
        connection_id: &str,
        session_id: &str,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;
        if conn.push_terminal(session_id) {
            if let Err(e) = self.add_ref(connection_id).await {
                conn.take_terminal(session_id);
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn remove_terminal(
        self: &Arc<Self>,
        connection_id: &str,
        session_id: &str,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;
        if conn.take_terminal(session_id) {
            self.release(connection_id).await?;
        }
        Ok(())
    }

    pub async fn add_forward(
        self: &Arc<Self>,
        connection_id: &str,
        forward_id: &str,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;
        if conn.push_forward(forward_id) {
            if let Err(e) = self.add_ref(connection_id).await {
                conn.take_forward(forward_id);
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn remove_forward(
        self: &Arc<Self>,
        connection_id: &str,
        forward_id: &str,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;
        if conn.take_forward(forward_id) {
            self.release(connection_id).await?;
        }
        Ok(())
    }

    /// 获取 / 创建连接的文件传输能力
    ///
    /// 首次创建时为连接计入一个引用；失效重建不重复计入。
    pub async fn acquire_file_transfer(
        self: &Arc<Self>,
        connection_id: &str,
    ) -> Result<(CapabilityHandle, AcquireOutcome), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        let state = conn.state();
        if conn.is_closing() || state.is_terminal() {
            return Err(ConnectionRegistryError::AlreadyDisconnected);
        }
        if !state.is_usable() {
            return Err(ConnectionRegistryError::InvalidState(format!(
                "connection {} is {}",
                connection_id,
                state.as_str()
            )));
        }

        let _accounting = conn.file_transfer().lock_accounting().await;
        let (cap, outcome) = conn
            .acquire_file_transfer()
            .await
            .map_err(|e| ConnectionRegistryError::CapabilityFailed(e.to_string()))?;

        if outcome == AcquireOutcome::Created {
            if let Err(e) = self.add_ref(connection_id).await {
                conn.file_transfer().clear().await;
                return Err(e);
            }
        }
        if outcome.is_new() {
            self.emitter
                .emit_sftp_ready(connection_id, true, Some(cap.cwd().to_string()));
        }

        Ok((cap, outcome))
    }

    /// 释放连接的文件传输能力：关闭实例、清空槽位并归还引用
    ///
    /// 返回槽位之前是否占有引用。槽位 ID 不变，之后的 acquire 视为新建。
    pub async fn release_file_transfer(
        self: &Arc<Self>,
        connection_id: &str,
    ) -> Result<bool, ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        let _accounting = conn.file_transfer().lock_accounting().await;
        let was_ready = conn.file_transfer().status().is_some();
        let held = conn.file_transfer().clear().await;
        if was_ready {
            self.emitter.emit_sftp_ready(connection_id, false, None);
        }
        if held {
            info!("Connection {} file transfer released", connection_id);
            self.release(connection_id).await?;
        }
        Ok(held)
    }

    /// 使文件传输实例失效（保留引用），就绪时发出 SftpReady(false)
    pub async fn invalidate_file_transfer(&self, conn: &ConnectionEntry) -> bool {
        let was_ready = conn.file_transfer().invalidate().await;
        if was_ready {
            self.emitter.emit_sftp_ready(&conn.id, false, None);
        }
        was_ready
    }

    /// 仅失效指定实例（调用方观察到通道损坏）
    pub async fn invalidate_file_transfer_instance(&self, conn: &ConnectionEntry, instance: u64) -> bool {
        let was_ready = conn.file_transfer().invalidate_instance(instance).await;
        if was_ready {
            self.emitter.emit_sftp_ready(&conn.id, false, None);
        }
        was_ready
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// 收集所有后代连接（广度优先，近的在前）
    pub fn collect_descendants(&self, connection_id: &str) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        let mut frontier = vec![connection_id.to_string()];

        while !frontier.is_empty() {
            let mut next_level = Vec::new();
            for entry in self.connections.iter() {
                let Some(parent) = entry.value().parent_connection_id() else {
                    continue;
                };
                if frontier.iter().any(|f| f == parent) && !result.contains(entry.key()) {
                    next_level.push(entry.key().clone());
                }
            }
            result.extend(next_level.iter().cloned());
            frontier = next_level;
        }

        result
    }

    /// 强制断开连接（不论引用计数）
    ///
    /// 后代连接先于自身断开（最深的最先）。
    pub async fn force_close(
        self: &Arc<Self>,
        connection_id: &str,
    ) -> Result<(), ConnectionRegistryError> {
        self.close_with_reason(connection_id, "force_close").await
    }

    pub(super) async fn close_with_reason(
        self: &Arc<Self>,
        connection_id: &str,
        reason: &str,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        let descendants = self.collect_descendants(connection_id);
        for child_id in descendants.iter().rev() {
            if let Some(child) = self.get_connection(child_id) {
                info!(
                    "Disconnecting child connection {} (ancestor: {})",
                    child_id, connection_id
                );
                self.destroy(&child, "parent_closed").await;
            }
        }

        info!("Force disconnecting connection {} ({})", connection_id, reason);
        self.destroy(&conn, reason).await;
        Ok(())
    }

    /// 断开所有连接（退出时调用）
    pub async fn disconnect_all(self: &Arc<Self>) {
        info!("Disconnecting all SSH connections...");
        let roots: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.value().parent_connection_id().is_none())
            .map(|e| e.key().clone())
            .collect();

        for connection_id in roots {
            if let Err(e) = self.force_close(&connection_id).await {
                debug!("Connection {} already gone: {}", connection_id, e);
            }
        }
        info!("All SSH connections disconnected");
    }

    async fn destroy(self: &Arc<Self>, conn: &Arc<ConnectionEntry>, reason: &str) {
        {
            let _guard = conn.lock_transitions().await;
            if !conn.begin_close() {
                return;
            }
            if !conn.state().is_terminal() {
                let _ = conn.set_state(ConnectionState::Disconnecting);
            }
        }
        self.finish_close(conn, reason).await;
    }

    /// 关闭流程后半段：调用方已通过 `begin_close`
    async fn finish_close(self: &Arc<Self>, conn: &Arc<ConnectionEntry>, reason: &str) {
        conn.cancel_idle_timer();
        conn.cancel_heartbeat();
        self.reconnects.discard(&conn.id);

        // 文件传输能力随连接销毁
        conn.file_transfer().clear().await;
        conn.handle().disconnect().await;

        {
            let _guard = conn.lock_transitions().await;
            if !conn.state().is_terminal() {
                let _ = conn.set_state(ConnectionState::Disconnected);
            }
            self.emitter.emit_connection_state_changed(
                &conn.id,
                NodeReadiness::Disconnected,
                reason,
            );
            self.publish_status(conn, Vec::new());
        }

        self.connections.remove(&conn.id);
        self.emitter.unregister(&conn.id);
        self.publish(PoolEvent::Closed {
            connection_id: conn.id.clone(),
            reason: reason.to_string(),
        });
        info!("Connection {} disconnected and removed ({})", conn.id, reason);

        // 如果是隧道连接，减少父连接的引用计数
        if let Some(parent_id) = conn.parent_connection_id() {
            match self.release(parent_id).await {
                Ok(count) => debug!(
                    "Parent connection {} ref_count -> {} (child {} closed)",
                    parent_id, count, conn.id
                ),
                Err(e) => debug!("Parent connection {} not released: {}", parent_id, e),
            }
        }
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    pub fn get_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.get_connection(connection_id).map(|c| c.to_info())
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> =
            self.connections.iter().map(|e| e.value().to_info()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// 获取连接池统计信息
    pub fn get_stats(&self) -> ConnectionPoolStats {
        let config = self.config();

        let mut active_connections = 0;
        let mut idle_connections = 0;
        let mut reconnecting_connections = 0;
        let mut link_down_connections = 0;
        let mut total_terminals = 0;
        let mut total_sftp_sessions = 0;
        let mut total_forwards = 0;
        let mut total_ref_count: u32 = 0;

        for entry in self.connections.iter() {
            let conn = entry.value();
            match conn.state() {
                ConnectionState::Active => active_connections += 1,
                ConnectionState::Idle => idle_connections += 1,
                ConnectionState::Reconnecting => reconnecting_connections += 1,
                ConnectionState::LinkDown => link_down_connections += 1,
                _ => {}
            }

            total_terminals += conn.terminal_ids.read().len();
            if conn.sftp_status().is_some() {
                total_sftp_sessions += 1;
            }
            total_forwards += conn.forward_ids.read().len();
            total_ref_count = total_ref_count.saturating_add(conn.ref_count());
        }

        ConnectionPoolStats {
            total_connections: self.connections.len(),
            active_connections,
            idle_connections,
            reconnecting_connections,
            link_down_connections,
            total_terminals,
            total_sftp_sessions,
            total_forwards,
            total_ref_count,
            pool_capacity: config.max_connections,
            idle_timeout_secs: config.idle_timeout_secs,
        }
    }
}
