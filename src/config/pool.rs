//! 连接池配置
//!
//! 所有时间参数均可覆盖；缺省值对应 15s 心跳 × 2 次失败 = 30s 内必触发重连。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 默认空闲超时时间（30 分钟）
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// 心跳间隔（15 秒）
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// 单次探测超时（5 秒）
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// 心跳连续失败次数阈值，达到后标记为 LinkDown
const DEFAULT_HEARTBEAT_FAIL_THRESHOLD: u32 = 2;

/// 重连退避序列（毫秒）
const DEFAULT_RECONNECT_BACKOFF_MS: [u64; 5] = [1_000, 2_000, 4_000, 8_000, 16_000];

/// 重连最大间隔
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 16_000;

/// 最大重连次数
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// resolve_connection 等待连接就绪的超时
const DEFAULT_CONNECT_WAIT_TIMEOUT_SECS: u64 = 15;

/// 单次建连（握手 + 认证）超时
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 空闲超时时间（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// 最大连接数（0 = 无限制）
    #[serde(default)]
    pub max_connections: usize,

    /// 心跳间隔（秒）
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// 单次心跳探测超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// 连续超时多少次后判定 LinkDown
    #[serde(default = "default_heartbeat_fail_threshold")]
    pub heartbeat_fail_threshold: u32,

    /// 重连退避序列（毫秒），超出序列长度后按最后一项倍增
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: Vec<u64>,

    /// 退避上限（毫秒）
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// 最大重连次数
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// 路由层等待 Connecting/Reconnecting 结束的超时（秒）
    #[serde(default = "default_connect_wait_timeout_secs")]
    pub connect_wait_timeout_secs: u64,

    /// 单次建连超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_heartbeat_fail_threshold() -> u32 {
    DEFAULT_HEARTBEAT_FAIL_THRESHOLD
}

fn default_reconnect_backoff_ms() -> Vec<u64> {
    DEFAULT_RECONNECT_BACKOFF_MS.to_vec()
}

fn default_reconnect_max_delay_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}

fn default_reconnect_max_attempts() -> u32 {
    DEFAULT_RECONNECT_MAX_ATTEMPTS
}

fn default_connect_wait_timeout_secs() -> u64 {
    DEFAULT_CONNECT_WAIT_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_connections: 0,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            heartbeat_fail_threshold: DEFAULT_HEARTBEAT_FAIL_THRESHOLD,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS.to_vec(),
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            connect_wait_timeout_secs: DEFAULT_CONNECT_WAIT_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connect_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_wait_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 第 `attempt` 次失败后的退避时长（attempt 从 1 开始）
    ///
    /// 序列之内直接取值；超出后从最后一项开始倍增。结果总是被
    /// `reconnect_max_delay_ms` 截断。
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = self.reconnect_max_delay_ms;
        let idx = attempt.saturating_sub(1) as usize;
        let ms = match self.reconnect_backoff_ms.get(idx) {
            Some(ms) => *ms,
            None => {
                let last = self.reconnect_backoff_ms.last().copied().unwrap_or(cap);
                let extra = (idx + 1 - self.reconnect_backoff_ms.len()).min(32) as u32;
                last.saturating_mul(2u64.saturating_pow(extra))
            }
        };
        Duration::from_millis(ms.min(cap))
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be > 0".into());
        }
        if self.probe_timeout_secs == 0 {
            return Err("probe_timeout_secs must be > 0".into());
        }
        if self.heartbeat_fail_threshold == 0 {
            return Err("heartbeat_fail_threshold must be >= 1".into());
        }
        if self.reconnect_max_attempts == 0 {
            return Err("reconnect_max_attempts must be >= 1".into());
        }
        if self.reconnect_backoff_ms.is_empty() {
            return Err("reconnect_backoff_ms must not be empty".into());
        }
        Ok(())
    }
}
