//! 心跳监控
//!
//! 每个 Active/Idle 连接一个周期任务。探测经由 handle owner 任务打开并关闭
//! 一个 channel：
//! - 成功：重置失败计数、刷新活动时间
//! - 超时：失败计数 +1，达到阈值标记 LinkDown
//! - IO 错误：物理连接已断，立即标记 LinkDown
//!
//! 标记 LinkDown 后心跳循环退出，交由重连编排接管。

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::connection_registry::{ConnectionState, SshConnectionRegistry};
use super::handle_owner::PingResult;

impl SshConnectionRegistry {
    /// 启动连接的心跳监控任务（替换已有任务）
    pub(crate) fn start_heartbeat(self: &Arc<Self>, connection_id: &str) {
        let Some(conn) = self.get_connection(connection_id) else {
            warn!("Cannot start heartbeat for non-existent connection {}", connection_id);
            return;
        };

        let config = self.config();
        let interval = config.heartbeat_interval();
        let probe_timeout = config.probe_timeout();
        let threshold = config.heartbeat_fail_threshold;

        let registry = Arc::downgrade(self);
        let connection_id = connection_id.to_string();
        let task_conn = conn.clone();

        let task = tokio::spawn(async move {
            let conn = task_conn;
            info!(
                "Heartbeat task started for connection {} (interval={}s, threshold={})",
                connection_id,
                interval.as_secs(),
                threshold
            );
            // 首次探测在一个间隔之后
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                ticker.tick().await;
                debug!("Heartbeat tick for connection {}", connection_id);

                // 只有 Active/Idle 需要心跳
                let state = conn.state();
                if !state.is_usable() || conn.is_closing() {
                    debug!(
                        "Connection {} state is {}, stopping heartbeat",
                        connection_id,
                        state.as_str()
                    );
                    break;
                }

                // 每次重新获取 handle，重连后自动指向新连接
                let ping_result = conn.handle().ping(probe_timeout).await;
                debug!("Connection {} ping result: {:?}", connection_id, ping_result);

                let reason = match ping_result {
                    PingResult::Ok => {
                        conn.reset_heartbeat_failures();
                        conn.update_activity();
                        continue;
                    }
                    PingResult::IoError => {
                        error!(
                            "Connection {} IO error detected, marking link down",
                            connection_id
                        );
                        "heartbeat io error"
                    }
                    PingResult::Timeout => {
                        let failures = conn.increment_heartbeat_failures();
                        warn!(
                            "Connection {} heartbeat timeout ({}/{})",
                            connection_id, failures, threshold
                        );
                        if failures < threshold {
                            continue;
                        }
                        error!(
                            "Connection {} marked as LinkDown after {} heartbeat failures",
                            connection_id, failures
                        );
                        "heartbeat timeout"
                    }
                };

                let Some(registry) = registry.upgrade() else {
                    break;
                };
                conn.detach_heartbeat();
                registry.mark_link_down(&connection_id, reason).await;
                break;
            }

            info!("Heartbeat task stopped for connection {}", connection_id);
        });

        conn.set_heartbeat_task(task);
    }

    /// Active/Idle → LinkDown，然后交给重连编排
    ///
    /// 已经不在 Active/Idle（其他路径先处理了）时什么都不做。
    pub(crate) async fn mark_link_down(self: &Arc<Self>, connection_id: &str, reason: &str) {
        let Some(conn) = self.get_connection(connection_id) else {
            return;
        };

        {
            let _guard = conn.lock_transitions().await;
            if conn.is_closing() || !conn.state().is_usable() {
                debug!(
                    "Connection {} already {}, ignoring link down",
                    connection_id,
                    conn.state().as_str()
                );
                return;
            }
            conn.cancel_idle_timer();
            let affected = self.collect_descendants(connection_id);
            if let Err(e) =
                self.transition_locked(&conn, ConnectionState::LinkDown, reason, affected)
            {
                warn!("Connection {} link down rejected: {}", connection_id, e);
                return;
            }
        }

        self.schedule_reconnect(connection_id).await;
    }
}
