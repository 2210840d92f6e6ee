//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for a connection handle.
//!
//! # Architecture
//!
//! Only one task owns the `Box<dyn RemoteHandle>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, connection_id);
//!
//! // Open a channel
//! let channel = controller.open_channel(ChannelKind::Session).await?;
//!
//! // Liveness probe with a 5s timeout
//! let result = controller.ping(Duration::from_secs(5)).await;
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::transport::{ChannelKind, FileTransferChannel, RemoteChannel, RemoteHandle};

/// Upper bound for a single channel / subsystem open inside the owner loop
///
/// The loop is serial: an open that never completes would park every later
/// command, heartbeat probes included.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Ping 结果类型，区分不同的失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// 连接正常
    Ok,
    /// 超时（可能是网络延迟，可重试）
    Timeout,
    /// IO 错误（物理连接断开，应立即重连）
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a channel of the given kind
    OpenChannel {
        kind: ChannelKind,
        reply_tx: oneshot::Sender<Result<Box<dyn RemoteChannel>, SshError>>,
    },

    /// Open the file-transfer subsystem
    OpenFileTransfer {
        reply_tx: oneshot::Sender<Result<Box<dyn FileTransferChannel>, SshError>>,
    },

    /// Probe the connection (heartbeat)
    Ping {
        timeout: Duration,
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// # Clone Semantics
///
/// `HandleController` implements `Clone`; cloning copies the Sender.
/// Any holder has full control over the connection, so controllers stay
/// in-process and are never serialized.
///
/// Long-lived holders must not cache a controller across a reconnect: the
/// entry swaps in a fresh controller and the old one goes dead. Re-fetch it
/// via `ConnectionEntry::handle()` before each operation.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Create a new HandleController with the given sender
    ///
    /// Primarily for tests. In production, use `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a channel
    pub async fn open_channel(&self, kind: ChannelKind) -> Result<Box<dyn RemoteChannel>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenChannel { kind, reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Open a direct-tcpip channel (tunnels, local forwards)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn RemoteChannel>, SshError> {
        self.open_channel(ChannelKind::DirectTcpip {
            host: host.to_string(),
            port,
        })
        .await
    }

    /// Open the file-transfer subsystem
    pub async fn open_file_transfer(&self) -> Result<Box<dyn FileTransferChannel>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenFileTransfer { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Disconnect the connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Ping the connection (for heartbeat)
    ///
    /// `timeout` bounds the whole round trip, including time spent queued
    /// behind other commands.
    pub async fn ping(&self, timeout: Duration) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { timeout, reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(result) => result.unwrap_or(PingResult::IoError),
            Err(_) => PingResult::Timeout,
        }
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(handle: Box<dyn RemoteHandle>, connection_id: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle;

        info!("Handle owner task started for connection {}", connection_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenChannel { kind, reply_tx } => {
                    if reply_tx.is_closed() {
                        continue;
                    }
                    let result = bounded_open(&connection_id, handle.open_channel(kind)).await;
                    if let Err(Err(e)) = reply_tx.send(result) {
                        warn!("Caller dropped before receiving channel result: {}", e);
                    }
                }

                HandleCommand::OpenFileTransfer { reply_tx } => {
                    if reply_tx.is_closed() {
                        continue;
                    }
                    let result = bounded_open(&connection_id, handle.open_file_transfer()).await;
                    if let Err(Ok(mut orphan)) = reply_tx.send(result) {
                        // 调用方已放弃，关闭孤儿子系统，避免服务端泄漏
                        warn!("Caller dropped after file transfer opened, closing orphan");
                        let _ = orphan.close().await;
                    }
                }

                HandleCommand::Ping { timeout, reply_tx } => {
                    // 调用方已超时放弃
                    if reply_tx.is_closed() {
                        continue;
                    }
                    debug!("Probe for connection {}", connection_id);
                    let result = match tokio::time::timeout(timeout, handle.probe()).await {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e @ (SshError::Disconnected | SshError::IoError(_)))) => {
                            warn!("Probe transport error for connection {}: {}", connection_id, e);
                            PingResult::IoError
                        }
                        Ok(Err(e)) => {
                            warn!(
                                "Probe error for connection {} (treating as soft failure): {}",
                                connection_id, e
                            );
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Probe timeout for connection {} ({:?})", connection_id, timeout);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for connection {}", connection_id);
                    break;
                }
            }
        }

        // Drain all pending commands, notify callers that connection is closed
        drain_pending_commands(&mut cmd_rx);

        handle.close().await;
        info!("Handle owner task terminated for connection {}", connection_id);
    });

    HandleController { cmd_tx }
}

async fn bounded_open<T>(
    connection_id: &str,
    open: impl std::future::Future<Output = Result<T, SshError>>,
) -> Result<T, SshError> {
    match tokio::time::timeout(CHANNEL_OPEN_TIMEOUT, open).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Channel open timed out for connection {} ({:?})",
                connection_id, CHANNEL_OPEN_TIMEOUT
            );
            Err(SshError::Timeout(format!(
                "channel open exceeded {}s",
                CHANNEL_OPEN_TIMEOUT.as_secs()
            )))
        }
    }
}

/// Drain all pending commands, returning Disconnected to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenChannel { reply_tx, .. } => {
                let _ = reply_tx.send(Err(SshError::Disconnected));
            }
            HandleCommand::OpenFileTransfer { reply_tx } => {
                let _ = reply_tx.send(Err(SshError::Disconnected));
            }
            HandleCommand::Ping { reply_tx, .. } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
