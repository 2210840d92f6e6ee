//! 文件传输能力槽
//!
//! 每个 `ConnectionEntry` 至多持有一个文件传输实例，懒创建，随连接销毁。
//! 槽位 ID 在连接生命周期内稳定，实例本身可以因 epoch 变化被重建。
//!
//! 状态：
//! - `Empty`：从未创建（或已被 `clear`），不占引用计数
//! - `Ready`：可用实例，记录构建时的 handle epoch
//! - `Stale`：已失效（重连 / 通道损坏），仍占有一个引用，下次 acquire 原位重建

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::HandleController;
use super::transport::FileTransferChannel;

/// 一个已打开的文件传输实例
pub struct FileTransferCapability {
    /// 所属槽位 ID（稳定）
    pub slot_id: String,
    /// 本实例编号，每次创建/重建 +1
    pub instance: u64,
    /// 构建时的 handle epoch
    pub epoch: u64,
    cwd: String,
    channel: Mutex<Box<dyn FileTransferChannel>>,
}

impl FileTransferCapability {
    /// 初始工作目录（远端 `realpath(".")`）
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub async fn realpath(&self, path: &str) -> Result<String, SshError> {
        self.channel.lock().await.realpath(path).await
    }

    async fn close(&self) {
        // 正在执行的操作持有锁时跳过，最后一个 Arc 释放时通道随之销毁
        if let Ok(mut channel) = self.channel.try_lock() {
            if let Err(e) = channel.close().await {
                debug!("Closing file transfer {} failed: {}", self.slot_id, e);
            }
        }
    }
}

impl std::fmt::Debug for FileTransferCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferCapability")
            .field("slot_id", &self.slot_id)
            .field("instance", &self.instance)
            .field("epoch", &self.epoch)
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// 调用方拿到的能力句柄
pub type CapabilityHandle = Arc<FileTransferCapability>;

/// `acquire` 的结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// 复用已有实例
    Existing,
    /// 首次创建（调用方需要为连接增加一个引用）
    Created,
    /// 失效后原位重建（引用已在创建时计入）
    Rebuilt,
}

impl AcquireOutcome {
    /// 是否产生了新实例（需要发 SftpReady）
    pub fn is_new(&self) -> bool {
        !matches!(self, AcquireOutcome::Existing)
    }
}

enum SlotState {
    Empty,
    Ready(CapabilityHandle),
    Stale,
}

pub struct FileTransferSlot {
    slot_id: String,
    inner: RwLock<SlotState>,
    /// 同步镜像：Some(cwd) 表示就绪，供快照读取
    status: parking_lot::RwLock<Option<String>>,
    instances: AtomicU64,
    /// 串行化“创建 + 计入引用”与“清空 + 归还引用”
    accounting: Mutex<()>,
}

impl FileTransferSlot {
    pub fn new() -> Self {
        Self {
            slot_id: uuid::Uuid::new_v4().to_string(),
            inner: RwLock::new(SlotState::Empty),
            status: parking_lot::RwLock::new(None),
            instances: AtomicU64::new(0),
            accounting: Mutex::new(()),
        }
    }

    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    /// 引用计数记账锁，注册表在 acquire / release 两侧持有
    pub(crate) async fn lock_accounting(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.accounting.lock().await
    }

    /// 同步读取：是否就绪以及 cwd
    pub fn status(&self) -> Option<String> {
        self.status.read().clone()
    }

    /// 是否占有连接引用（Ready 或 Stale）
    pub async fn holds_ref(&self) -> bool {
        !matches!(*self.inner.read().await, SlotState::Empty)
    }

    /// 获取或创建实例（double-checked）
    ///
    /// 读锁快速路径命中同 epoch 的 Ready 实例直接返回；否则进入写锁
    /// 二次检查，仍未命中才打开新的子系统。并发调用者在写锁上排队，
    /// 最终拿到同一个实例。
    pub async fn acquire(
        &self,
        epoch: u64,
        handle: &HandleController,
    ) -> Result<(CapabilityHandle, AcquireOutcome), SshError> {
        {
            let guard = self.inner.read().await;
            if let SlotState::Ready(cap) = &*guard {
                if cap.epoch == epoch {
                    return Ok((cap.clone(), AcquireOutcome::Existing));
                }
            }
        }

        let mut guard = self.inner.write().await;
        let outcome = match &*guard {
            SlotState::Ready(cap) if cap.epoch == epoch => {
                return Ok((cap.clone(), AcquireOutcome::Existing));
            }
            SlotState::Ready(_) | SlotState::Stale => AcquireOutcome::Rebuilt,
            SlotState::Empty => AcquireOutcome::Created,
        };

        let mut channel = handle.open_file_transfer().await?;
        let cwd = match channel.realpath(".").await {
            Ok(cwd) => cwd,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        let instance = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        let cap = Arc::new(FileTransferCapability {
            slot_id: self.slot_id.clone(),
            instance,
            epoch,
            cwd: cwd.clone(),
            channel: Mutex::new(channel),
        });

        if let SlotState::Ready(old) = std::mem::replace(&mut *guard, SlotState::Ready(cap.clone())) {
            old.close().await;
        }
        *self.status.write() = Some(cwd);

        info!(
            "File transfer slot {} {:?} (instance {}, epoch {})",
            self.slot_id, outcome, instance, epoch
        );
        Ok((cap, outcome))
    }

    /// 使当前实例失效（保留引用），返回之前是否就绪
    pub async fn invalidate(&self) -> bool {
        let mut guard = self.inner.write().await;
        let was_ready = match std::mem::replace(&mut *guard, SlotState::Empty) {
            SlotState::Ready(old) => {
                old.close().await;
                *guard = SlotState::Stale;
                true
            }
            SlotState::Stale => {
                *guard = SlotState::Stale;
                false
            }
            SlotState::Empty => false,
        };
        *self.status.write() = None;
        if was_ready {
            debug!("File transfer slot {} invalidated", self.slot_id);
        }
        was_ready
    }

    /// 仅当当前实例仍是 `instance` 时才失效（避免并发重建后误杀新实例）
    pub async fn invalidate_instance(&self, instance: u64) -> bool {
        {
            let guard = self.inner.read().await;
            match &*guard {
                SlotState::Ready(cap) if cap.instance == instance => {}
                _ => return false,
            }
        }
        let mut guard = self.inner.write().await;
        let old = match &*guard {
            SlotState::Ready(cap) if cap.instance == instance => cap.clone(),
            _ => return false,
        };
        *guard = SlotState::Stale;
        *self.status.write() = None;
        drop(guard);
        old.close().await;
        warn!(
            "File transfer slot {} instance {} marked broken",
            self.slot_id, instance
        );
        true
    }

    /// 销毁：关闭实例并清空槽位，返回之前是否占有引用
    pub async fn clear(&self) -> bool {
        let mut guard = self.inner.write().await;
        let held = match std::mem::replace(&mut *guard, SlotState::Empty) {
            SlotState::Ready(old) => {
                old.close().await;
                true
            }
            SlotState::Stale => true,
            SlotState::Empty => false,
        };
        *self.status.write() = None;
        held
    }
}

impl Default for FileTransferSlot {
    fn default() -> Self {
        Self::new()
    }
}
