//! 重连编排
//!
//! 每条失败连接至多一个 `ReconnectJob`。流程：
//!
//! 1. 级联：所有传递后代（按 `parent_connection_id` 广度优先）停止心跳、
//!    叫停自身重连任务、标记 LinkDown 并通知其节点。子连接不自动重连。
//! 2. 自身切到 Reconnecting。
//! 3. 立即尝试；失败后按退避序列等待再试，期间可被取消。
//! 4. 成功：在原条目中替换 handle（epoch + 1），重置计数，失效文件传输，
//!    重启心跳，按引用计数进入 Active/Idle。
//! 5. 次数耗尽：Disconnected 并销毁（含后代）。
//! 6. 认证类错误：Error 终态，不再重试。
//!
//! 任务状态在同一把锁内结算：先提交的成功生效，先落地的取消会丢弃
//! 迟到的 handle。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection_registry::{
    ConnectionEntry, ConnectionRegistryError, ConnectionState, SshConnectionRegistry,
};
use super::error::SshError;
use super::events::{now_millis, PoolEvent};
use super::handle_owner::spawn_handle_owner_task;
use super::transport::RemoteHandle;
use crate::config::PoolConfig;

/// 重连任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 已创建，尚未开始尝试
    Pending,
    /// 正在尝试 / 退避中
    Retrying,
    /// 已提交新 handle
    Succeeded,
    /// 次数耗尽
    Exhausted,
    /// 不可恢复错误（认证 / 主机密钥）
    Failed,
    /// 被取消（用户取消或被级联叫停）
    Cancelled,
}

impl JobStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

/// 单条连接的重连任务
pub struct ReconnectJob {
    pub connection_id: String,
    pub max_attempts: u32,
    attempt: AtomicU32,
    current_delay_ms: AtomicU64,
    status: parking_lot::Mutex<JobStatus>,
    token: CancellationToken,
}

impl ReconnectJob {
    fn new(connection_id: &str, max_attempts: u32) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            max_attempts,
            attempt: AtomicU32::new(0),
            current_delay_ms: AtomicU64::new(0),
            status: parking_lot::Mutex::new(JobStatus::Pending),
            token: CancellationToken::new(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.current_delay_ms.load(Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn begin_attempt(&self) -> u32 {
        let mut status = self.status.lock();
        if !status.is_settled() {
            *status = JobStatus::Retrying;
        }
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 结算任务；已被结算过返回 false
    fn settle(&self, outcome: JobStatus) -> bool {
        let mut status = self.status.lock();
        if status.is_settled() {
            return false;
        }
        *status = outcome;
        true
    }
}

/// 重连任务表
pub struct ReconnectOrchestrator {
    jobs: DashMap<String, Arc<ReconnectJob>>,
}

impl ReconnectOrchestrator {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ReconnectJob>> {
        self.jobs.get(connection_id).map(|j| j.value().clone())
    }

    pub fn has_job(&self, connection_id: &str) -> bool {
        self.jobs.contains_key(connection_id)
    }

    pub fn active_jobs(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.key().clone()).collect()
    }

    /// 叫停并移除任务（不触发销毁）
    pub(super) fn discard(&self, connection_id: &str) {
        if let Some((_, job)) = self.jobs.remove(connection_id) {
            job.settle(JobStatus::Cancelled);
            job.token.cancel();
            debug!("Reconnect job for {} discarded", connection_id);
        }
    }

    fn insert(&self, job: Arc<ReconnectJob>) {
        if let Some(old) = self.jobs.insert(job.connection_id.clone(), job) {
            old.settle(JobStatus::Cancelled);
            old.token.cancel();
            debug!("Reconnect job for {} reset", old.connection_id);
        }
    }

    fn remove_if_same(&self, connection_id: &str, job: &Arc<ReconnectJob>) {
        self.jobs
            .remove_if(connection_id, |_, current| Arc::ptr_eq(current, job));
    }
}

impl Default for ReconnectOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SshConnectionRegistry {
    /// 是否有进行中的重连任务
    pub fn has_reconnect_job(&self, connection_id: &str) -> bool {
        self.reconnects.has_job(connection_id)
    }

    pub fn reconnect_job(&self, connection_id: &str) -> Option<Arc<ReconnectJob>> {
        self.reconnects.get(connection_id)
    }

    /// 创建或重置连接的重连任务
    ///
    /// 级联在此函数返回前完成，之后才会进行第一次尝试。
    pub async fn schedule_reconnect(self: &Arc<Self>, connection_id: &str) {
        let Some(conn) = self.get_connection(connection_id) else {
            return;
        };
        if conn.is_closing() {
            return;
        }

        let config = self.config();
        let job = Arc::new(ReconnectJob::new(connection_id, config.reconnect_max_attempts));
        self.reconnects.insert(job.clone());

        let affected = self.cascade_link_down(connection_id).await;
        info!(
            "Reconnect scheduled for connection {} (max_attempts={}, {} descendants link down)",
            connection_id,
            job.max_attempts,
            affected.len()
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.run_reconnect(conn, job, config).await;
        });
    }

    /// 把所有后代标记为 LinkDown，停止它们的心跳与重连任务
    async fn cascade_link_down(&self, root_id: &str) -> Vec<String> {
        let descendants = self.collect_descendants(root_id);

        for child_id in &descendants {
            let Some(child) = self.get_connection(child_id) else {
                continue;
            };
            child.cancel_heartbeat();
            self.reconnects.discard(child_id);

            let _guard = child.lock_transitions().await;
            if child.is_closing() {
                continue;
            }
            if matches!(
                child.state(),
                ConnectionState::Active | ConnectionState::Idle | ConnectionState::Reconnecting
            ) {
                child.cancel_idle_timer();
                if let Err(e) = self.transition_locked(
                    &child,
                    ConnectionState::LinkDown,
                    "parent link down",
                    Vec::new(),
                ) {
                    warn!("Cascade to {} rejected: {}", child_id, e);
                } else {
                    info!(
                        "Connection {} marked LinkDown (ancestor {} failed)",
                        child_id, root_id
                    );
                }
            }
        }

        descendants
    }

    async fn run_reconnect(
        self: Arc<Self>,
        conn: Arc<ConnectionEntry>,
        job: Arc<ReconnectJob>,
        config: PoolConfig,
    ) {
        let connection_id = conn.id.clone();

        {
            let _guard = conn.lock_transitions().await;
            // 级联先取消 token 再拿锁，锁内检查可避免被叫停后又切回 Reconnecting
            if job.is_cancelled() {
                return;
            }
            if let Err(e) =
                self.transition_locked(&conn, ConnectionState::Reconnecting, "reconnecting", Vec::new())
            {
                warn!("Connection {} cannot start reconnect: {}", connection_id, e);
                job.settle(JobStatus::Cancelled);
                self.reconnects.remove_if_same(&connection_id, &job);
                return;
            }
        }
        info!("Reconnect task started for connection {}", connection_id);

        loop {
            if job.is_cancelled() {
                debug!("Reconnect task for {} cancelled", connection_id);
                return;
            }

            let attempt = job.begin_attempt();
            info!(
                "Connection {} reconnect attempt {}/{}",
                connection_id, attempt, job.max_attempts
            );

            match self.try_reconnect(&conn, &config).await {
                Ok(handle) => {
                    if !job.settle(JobStatus::Succeeded) {
                        warn!(
                            "Connection {} reconnect succeeded after cancellation, discarding handle",
                            connection_id
                        );
                        let mut handle = handle;
                        handle.close().await;
                        return;
                    }
                    self.reconnects.remove_if_same(&connection_id, &job);
                    info!(
                        "Connection {} reconnected successfully (attempt {})",
                        connection_id, attempt
                    );
                    if let Err(e) = self.commit_reconnect(&conn, handle).await {
                        warn!("Connection {} reconnect commit rejected: {}", connection_id, e);
                    }
                    return;
                }
                Err(e) if e.is_fatal() => {
                    if !job.settle(JobStatus::Failed) {
                        return;
                    }
                    self.reconnects.remove_if_same(&connection_id, &job);
                    error!(
                        "Connection {} reconnect failed permanently: {}",
                        connection_id, e
                    );
                    if let Err(te) = self
                        .transition(&conn, ConnectionState::Error(e.to_string()), "reconnect failed")
                        .await
                    {
                        debug!("Connection {} error state rejected: {}", connection_id, te);
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Connection {} reconnect attempt {} failed: {}",
                        connection_id, attempt, e
                    );

                    if attempt >= job.max_attempts {
                        if !job.settle(JobStatus::Exhausted) {
                            return;
                        }
                        self.reconnects.remove_if_same(&connection_id, &job);
                        error!(
                            "Connection {} reconnect failed after {} attempts, giving up",
                            connection_id, attempt
                        );
                        if let Err(ce) = self
                            .close_with_reason(&connection_id, "reconnect_exhausted")
                            .await
                        {
                            debug!("Connection {} already closed: {}", connection_id, ce);
                        }
                        return;
                    }

                    let delay = config.backoff_delay(attempt);
                    job.current_delay_ms
                        .store(delay.as_millis() as u64, Ordering::SeqCst);
                    self.publish(PoolEvent::ReconnectProgress {
                        connection_id: connection_id.clone(),
                        attempt,
                        max_attempts: job.max_attempts,
                        next_retry_ms: delay.as_millis() as u64,
                        timestamp: now_millis(),
                    });

                    tokio::select! {
                        _ = job.token.cancelled() => {
                            debug!("Reconnect task for {} cancelled during backoff", connection_id);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 单次重连尝试（直连或经父连接隧道）
    async fn try_reconnect(
        &self,
        conn: &ConnectionEntry,
        config: &PoolConfig,
    ) -> Result<Box<dyn RemoteHandle>, SshError> {
        let tunnel = match conn.parent_connection_id() {
            Some(parent_id) => {
                let parent = self.get_connection(parent_id).ok_or_else(|| {
                    SshError::ConnectionFailed(format!("parent connection {} is gone", parent_id))
                })?;
                let state = parent.state();
                if !state.is_usable() {
                    return Err(SshError::ConnectionFailed(format!(
                        "parent connection {} is {}",
                        parent_id,
                        state.as_str()
                    )));
                }
                let channel = parent
                    .handle()
                    .open_direct_tcpip(&conn.target.host, conn.target.port)
                    .await?;
                Some(channel.into_io().ok_or_else(|| {
                    SshError::ChannelError("direct-tcpip channel has no stream".into())
                })?)
            }
            None => None,
        };

        let timeout = config.connect_timeout();
        match tokio::time::timeout(timeout, self.connector.connect(&conn.target, tunnel)).await {
            Ok(result) => result,
            Err(_) => Err(SshError::Timeout(format!(
                "reconnect to {} timed out after {:?}",
                conn.target.key(),
                timeout
            ))),
        }
    }

    /// 把新 handle 原位换入条目
    ///
    /// 换入与关闭流程的 `begin_close` 在同一把状态锁下互斥：条目已在关闭时
    /// 新 handle 直接断开，不会留在正在销毁的条目上。
    async fn commit_reconnect(
        self: &Arc<Self>,
        conn: &Arc<ConnectionEntry>,
        handle: Box<dyn RemoteHandle>,
    ) -> Result<(), ConnectionRegistryError> {
        let controller = spawn_handle_owner_task(handle, conn.id.clone());
        let swapped = {
            let _guard = conn.lock_transitions().await;
            if conn.is_closing() || conn.state().is_terminal() {
                None
            } else {
                Some(conn.swap_handle(controller.clone()))
            }
        };
        let Some((old, epoch)) = swapped else {
            warn!(
                "Connection {} closed before reconnect commit, dropping new handle",
                conn.id
            );
            controller.disconnect().await;
            return Err(ConnectionRegistryError::AlreadyDisconnected);
        };
        old.disconnect().await;

        conn.reset_heartbeat_failures();
        conn.update_activity();
        self.invalidate_file_transfer(conn).await;

        let next = {
            let _guard = conn.lock_transitions().await;
            let next = if conn.ref_count() > 0 {
                ConnectionState::Active
            } else {
                ConnectionState::Idle
            };
            self.transition_locked(conn, next.clone(), "reconnected", Vec::new())?;
            next
        };

        if next == ConnectionState::Idle {
            self.start_idle_timer(conn);
        }

        self.publish(PoolEvent::Reconnected {
            connection_id: conn.id.clone(),
            terminal_ids: conn.terminal_ids(),
            forward_ids: conn.forward_ids(),
        });
        self.start_heartbeat(&conn.id);

        info!(
            "Connection {} handle replaced (epoch {}, state {})",
            conn.id,
            epoch,
            next.as_str()
        );
        Ok(())
    }

    /// 取消重连：任务尚未结算时生效，连接随之销毁
    ///
    /// 返回是否真正取消（成功已提交或任务不存在时为 false）。
    pub async fn cancel_reconnect(self: &Arc<Self>, connection_id: &str) -> bool {
        let Some(job) = self.reconnects.get(connection_id) else {
            return false;
        };
        if !job.settle(JobStatus::Cancelled) {
            return false;
        }
        job.token.cancel();
        self.reconnects.remove_if_same(connection_id, &job);
        info!(
            "Reconnect for connection {} cancelled at attempt {}",
            connection_id,
            job.attempt()
        );

        if let Err(e) = self
            .close_with_reason(connection_id, "reconnect_cancelled")
            .await
        {
            debug!("Connection {} already gone: {}", connection_id, e);
        }
        true
    }

    /// 单次原位重建：LinkDown 的连接（通常是级联后的隧道子连接）
    /// 经由已恢复的父连接重新建立
    pub async fn reestablish(
        self: &Arc<Self>,
        connection_id: &str,
    ) -> Result<(), ConnectionRegistryError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or_else(|| ConnectionRegistryError::NotFound(connection_id.to_string()))?;

        if self.reconnects.has_job(connection_id) {
            return Err(ConnectionRegistryError::InvalidState(format!(
                "reconnect already in progress for {}",
                connection_id
            )));
        }

        {
            let _guard = conn.lock_transitions().await;
            let state = conn.state();
            if conn.is_closing() || state.is_terminal() {
                return Err(ConnectionRegistryError::AlreadyDisconnected);
            }
            match state {
                ConnectionState::Active | ConnectionState::Idle => return Ok(()),
                ConnectionState::LinkDown => {}
                other => {
                    return Err(ConnectionRegistryError::InvalidState(format!(
                        "cannot re-establish connection {} while {}",
                        connection_id,
                        other.as_str()
                    )))
                }
            }
            if let Some(parent_id) = conn.parent_connection_id() {
                let parent_ready = self
                    .get_connection(parent_id)
                    .map(|p| p.state().is_usable() && !p.is_closing())
                    .unwrap_or(false);
                if !parent_ready {
                    return Err(ConnectionRegistryError::ParentUnavailable(parent_id.to_string()));
                }
            }
            conn.cancel_heartbeat();
            self.transition_locked(
                &conn,
                ConnectionState::Reconnecting,
                "reestablishing",
                Vec::new(),
            )?;
        }

        info!("Re-establishing connection {}", connection_id);
        let config = self.config();
        match self.try_reconnect(&conn, &config).await {
            Ok(handle) => self.commit_reconnect(&conn, handle).await,
            Err(e) if e.is_fatal() => {
                let _ = self
                    .transition(&conn, ConnectionState::Error(e.to_string()), "reestablish failed")
                    .await;
                Err(e.into())
            }
            Err(e) => {
                warn!("Re-establish of {} failed: {}", connection_id, e);
                let _ = self
                    .transition(&conn, ConnectionState::LinkDown, "reestablish failed")
                    .await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::router::NodeEventEmitter;
    use crate::ssh::testing::{target, MockConnector};
    use tokio::sync::broadcast;

    fn registry_with(config: PoolConfig) -> (Arc<SshConnectionRegistry>, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let registry = SshConnectionRegistry::new(
            connector.clone(),
            Arc::new(NodeEventEmitter::new()),
            config,
        );
        (registry, connector)
    }

    async fn wait_state(conn: &ConnectionEntry, want: ConnectionState) {
        let mut rx = conn.subscribe_state();
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    async fn wait_closed(events: &mut broadcast::Receiver<PoolEvent>, id: &str) -> String {
        loop {
            match events.recv().await.unwrap() {
                PoolEvent::Closed {
                    connection_id,
                    reason,
                } if connection_id == id => return reason,
                _ => {}
            }
        }
    }

    #[test]
    fn test_job_settles_once() {
        let job = ReconnectJob::new("c", 5);
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.begin_attempt(), 1);
        assert_eq!(job.status(), JobStatus::Retrying);
        assert!(job.settle(JobStatus::Succeeded));
        assert!(!job.settle(JobStatus::Cancelled));
        assert_eq!(job.status(), JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_swaps_handle_in_place() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();
        registry.add_terminal(&entry.id, "t1").await.unwrap();
        registry.acquire_file_transfer(&entry.id).await.unwrap();
        assert_eq!(entry.ref_count(), 2);
        let mut events = registry.subscribe_pool_events();

        link.kill();
        wait_state(&entry, ConnectionState::Reconnecting).await;
        link.restore();
        wait_state(&entry, ConnectionState::Active).await;

        assert_eq!(entry.handle_epoch(), 1);
        assert_eq!(entry.heartbeat_failures(), 0);
        assert_eq!(entry.ref_count(), 2);
        assert!(entry.sftp_status().is_none(), "file transfer invalidated");
        assert!(entry.has_heartbeat());
        assert!(!registry.reconnects.has_job(&entry.id));
        assert!(registry.get_connection(&entry.id).is_some());

        let mut reconnected = None;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Reconnected { terminal_ids, .. } = event {
                reconnected = Some(terminal_ids);
            }
        }
        assert_eq!(reconnected, Some(vec!["t1".to_string()]));

        // 重建后的文件传输基于新 epoch
        let (cap, outcome) = registry.acquire_file_transfer(&entry.id).await.unwrap();
        assert_eq!(outcome, crate::ssh::AcquireOutcome::Rebuilt);
        assert_eq!(cap.epoch, 1);
        assert_eq!(entry.ref_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_without_refs_goes_idle() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();

        link.kill();
        wait_state(&entry, ConnectionState::Reconnecting).await;
        link.restore();
        wait_state(&entry, ConnectionState::Idle).await;
        assert!(entry.has_idle_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_exhaustion_is_terminal() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();
        registry.add_ref(&entry.id).await.unwrap();
        let mut events = registry.subscribe_pool_events();

        link.kill();
        wait_state(&entry, ConnectionState::Reconnecting).await;
        let started = tokio::time::Instant::now();

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                PoolEvent::ReconnectProgress { next_retry_ms, .. } => delays.push(next_retry_ms),
                PoolEvent::Closed { reason, .. } => {
                    assert_eq!(reason, "reconnect_exhausted");
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
        // 1 + 2 + 4 + 8 秒退避
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert_eq!(entry.state(), ConnectionState::Disconnected);
        assert!(registry.get_connection(&entry.id).is_none());
        // 1 次建连 + 5 次重连
        assert_eq!(link.connects(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cascade_precedes_first_attempt() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let root = registry.resolve(&target("root")).await.unwrap();
        let child = registry.resolve_tunneled(&root.id, &target("child")).await.unwrap();
        let grandchild = registry
            .resolve_tunneled(&child.id, &target("grandchild"))
            .await
            .unwrap();
        let mut events = registry.subscribe_pool_events();

        connector.link("root").kill();
        wait_state(&root, ConnectionState::Reconnecting).await;

        let mut order = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::StatusChanged {
                connection_id,
                status,
                affected_children,
                ..
            } = event
            {
                if connection_id == root.id && status == "link_down" {
                    assert_eq!(
                        affected_children,
                        vec![child.id.clone(), grandchild.id.clone()]
                    );
                }
                order.push((connection_id, status));
            }
        }
        let pos = |id: &str, status: &str| {
            order
                .iter()
                .position(|(c, s)| c == id && s == status)
                .unwrap()
        };
        let root_retry = pos(&root.id, "reconnecting");
        assert!(pos(&root.id, "link_down") < pos(&child.id, "link_down"));
        assert!(pos(&child.id, "link_down") < pos(&grandchild.id, "link_down"));
        assert!(pos(&grandchild.id, "link_down") < root_retry);

        assert!(!child.has_heartbeat());
        assert!(!grandchild.has_heartbeat());
        assert!(!registry.reconnects.has_job(&child.id));

        // 父连接恢复后子连接保持 LinkDown，直到显式重建
        connector.link("root").restore();
        wait_state(&root, ConnectionState::Active).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(child.state(), ConnectionState::LinkDown);

        registry.reestablish(&child.id).await.unwrap();
        assert_eq!(child.state(), ConnectionState::Active);
        assert_eq!(child.handle_epoch(), 1);
        assert_eq!(grandchild.state(), ConnectionState::LinkDown);
        registry.reestablish(&grandchild.id).await.unwrap();
        assert_eq!(grandchild.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reestablish_requires_usable_parent() {
        let (registry, connector) = registry_with(PoolConfig {
            reconnect_max_attempts: 50,
            ..Default::default()
        });
        let root = registry.resolve(&target("root")).await.unwrap();
        let child = registry.resolve_tunneled(&root.id, &target("child")).await.unwrap();

        connector.link("root").kill();
        wait_state(&child, ConnectionState::LinkDown).await;

        let err = registry.reestablish(&child.id).await.unwrap_err();
        assert!(matches!(err, ConnectionRegistryError::ParentUnavailable(_)));
        assert_eq!(child.state(), ConnectionState::LinkDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_during_reconnect_is_fatal() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();

        link.kill();
        wait_state(&entry, ConnectionState::Reconnecting).await;
        link.reject_auth(true);
        link.restore();

        let mut rx = entry.subscribe_state();
        rx.wait_for(|s| matches!(s, ConnectionState::Error(_)))
            .await
            .unwrap();
        let connects = link.connects();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(link.connects(), connects, "no retry after auth failure");
        assert!(matches!(entry.state(), ConnectionState::Error(_)));
        assert!(!registry.reconnects.has_job(&entry.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();
        let mut events = registry.subscribe_pool_events();

        link.kill();
        wait_state(&entry, ConnectionState::Reconnecting).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(registry.cancel_reconnect(&entry.id).await);
        assert_eq!(wait_closed(&mut events, &entry.id).await, "reconnect_cancelled");
        assert_eq!(entry.state(), ConnectionState::Disconnected);

        let connects = link.connects();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(link.connects(), connects);
        assert!(!registry.cancel_reconnect(&entry.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_after_cancel_is_discarded() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();
        let mut events = registry.subscribe_pool_events();

        link.set_connect_delay(Duration::from_secs(5));
        link.kill();
        wait_state(&entry, ConnectionState::Reconnecting).await;
        // 第一次尝试正在途中（5s 建连延迟）
        link.restore();
        assert!(registry.cancel_reconnect(&entry.id).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(link.connects(), 2);
        assert!(registry.get_connection(&entry.id).is_none());
        assert_eq!(entry.state(), ConnectionState::Disconnected);
        assert_eq!(entry.handle_epoch(), 0);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PoolEvent::Reconnected { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_onto_closed_entry_drops_new_handle() {
        let (registry, connector) = registry_with(PoolConfig::default());
        let link = connector.link("a");
        let entry = registry.resolve(&target("a")).await.unwrap();

        registry.force_close(&entry.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.closed_handles(), 1);

        // 关闭先于提交落地：新 handle 不能挂到已销毁的条目上
        let err = registry.commit_reconnect(&entry, link.handle()).await.err();
        assert!(matches!(err, Some(ConnectionRegistryError::AlreadyDisconnected)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.closed_handles(), 2);
        assert_eq!(entry.handle_epoch(), 0);
        assert_eq!(entry.state(), ConnectionState::Disconnected);
    }
}
