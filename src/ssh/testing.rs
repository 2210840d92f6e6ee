//! In-memory transport for tests
//!
//! Every target host maps to one `MockLink`. A link can be killed (transport
//! errors), hung (no reply at all), or restored. Handles obtained before a
//! kill stay dead even after `restore`, like a real TCP session would.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::config::ConnectTarget;
use super::error::SshError;
use super::transport::{
    ChannelKind, Connector, FileTransferChannel, RemoteChannel, RemoteHandle, TunnelIo,
};

struct LinkState {
    host: String,
    alive: AtomicBool,
    hung: AtomicBool,
    /// bumped by `kill()`, handles born under an older value are dead
    incarnation: AtomicU64,
    /// bumped by `break_file_transfer()`
    ft_incarnation: AtomicU64,
    open_channels: AtomicUsize,
    file_transfers_opened: AtomicU32,
    connects: AtomicU32,
    closed_handles: AtomicU32,
    fail_connects: AtomicU32,
    /// 拒绝接下来 N 次 session channel 打开（链路保持正常）
    fail_session_channels: AtomicU32,
    reject_auth: AtomicBool,
    connect_delay_ms: AtomicU64,
}

/// Test handle on one simulated remote host
#[derive(Clone)]
pub(crate) struct MockLink {
    state: Arc<LinkState>,
}

impl MockLink {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            state: Arc::new(LinkState {
                host: host.to_string(),
                alive: AtomicBool::new(true),
                hung: AtomicBool::new(false),
                incarnation: AtomicU64::new(0),
                ft_incarnation: AtomicU64::new(0),
                open_channels: AtomicUsize::new(0),
                file_transfers_opened: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                closed_handles: AtomicU32::new(0),
                fail_connects: AtomicU32::new(0),
                fail_session_channels: AtomicU32::new(0),
                reject_auth: AtomicBool::new(false),
                connect_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// A fresh handle bound to the link's current incarnation
    pub(crate) fn handle(&self) -> Box<dyn RemoteHandle> {
        Box::new(MockHandle {
            link: self.clone(),
            incarnation: self.state.incarnation.load(Ordering::SeqCst),
        })
    }

    /// Drop the link: live handles and new connects fail with transport errors
    pub(crate) fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.incarnation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stop answering without erroring
    pub(crate) fn hang(&self) {
        self.state.hung.store(true, Ordering::SeqCst);
    }

    /// Accept connects again (old handles stay dead)
    pub(crate) fn restore(&self) {
        self.state.hung.store(false, Ordering::SeqCst);
        self.state.alive.store(true, Ordering::SeqCst);
    }

    /// Break every open file-transfer channel while the link stays up
    pub(crate) fn break_file_transfer(&self) {
        self.state.ft_incarnation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_session_channels(&self, n: u32) {
        self.state.fail_session_channels.store(n, Ordering::SeqCst);
    }

    pub(crate) fn reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Handles whose owner task ran `close`
    pub(crate) fn closed_handles(&self) -> u32 {
        self.state.closed_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn open_channels(&self) -> usize {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    pub(crate) fn file_transfers_opened(&self) -> u32 {
        self.state.file_transfers_opened.load(Ordering::SeqCst)
    }

    fn handle_alive(&self, incarnation: u64) -> bool {
        self.state.alive.load(Ordering::SeqCst)
            && self.state.incarnation.load(Ordering::SeqCst) == incarnation
    }

    async fn stall_if_hung(&self) {
        if self.state.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

struct MockHandle {
    link: MockLink,
    incarnation: u64,
}

#[async_trait]
impl RemoteHandle for MockHandle {
    async fn open_channel(&mut self, kind: ChannelKind) -> Result<Box<dyn RemoteChannel>, SshError> {
        self.link.stall_if_hung().await;
        if !self.link.handle_alive(self.incarnation) {
            return Err(SshError::Disconnected);
        }
        if matches!(kind, ChannelKind::Session)
            && self
                .link
                .state
                .fail_session_channels
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(SshError::ChannelError("administratively prohibited".into()));
        }
        self.link.state.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            link: self.link.clone(),
            open: true,
        }))
    }

    async fn open_file_transfer(&mut self) -> Result<Box<dyn FileTransferChannel>, SshError> {
        self.link.stall_if_hung().await;
        if !self.link.handle_alive(self.incarnation) {
            return Err(SshError::Disconnected);
        }
        self.link
            .state
            .file_transfers_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockFileTransfer {
            link: self.link.clone(),
            incarnation: self.incarnation,
            ft_incarnation: self.link.state.ft_incarnation.load(Ordering::SeqCst),
        }))
    }

    async fn close(&mut self) {
        self.link.state.closed_handles.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockChannel {
    id: String,
    kind: ChannelKind,
    link: MockLink,
    open: bool,
}

impl MockChannel {
    fn mark_closed(&mut self) {
        if self.open {
            self.open = false;
            self.link.state.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.mark_closed();
        Ok(())
    }

    fn into_io(self: Box<Self>) -> Option<Box<dyn TunnelIo>> {
        if !matches!(self.kind, ChannelKind::DirectTcpip { .. }) {
            return None;
        }
        let (near, _far) = tokio::io::duplex(1024);
        Some(Box::new(near))
    }
}

struct MockFileTransfer {
    link: MockLink,
    incarnation: u64,
    ft_incarnation: u64,
}

#[async_trait]
impl FileTransferChannel for MockFileTransfer {
    async fn realpath(&mut self, path: &str) -> Result<String, SshError> {
        self.link.stall_if_hung().await;
        if !self.link.handle_alive(self.incarnation)
            || self.link.state.ft_incarnation.load(Ordering::SeqCst) != self.ft_incarnation
        {
            return Err(SshError::ChannelError("file transfer channel closed".into()));
        }
        match path {
            "." | "" => Ok(format!("/home/{}", self.link.state.host)),
            p if p.starts_with("/missing") => {
                Err(SshError::OperationFailed(format!("No such file: {}", p)))
            }
            p if p.starts_with('/') => Ok(p.trim_end_matches('/').to_string()),
            p => Ok(format!("/home/{}/{}", self.link.state.host, p)),
        }
    }

    async fn close(&mut self) -> Result<(), SshError> {
        Ok(())
    }
}

/// Connector resolving each target host to its `MockLink`
#[derive(Default)]
pub(crate) struct MockConnector {
    links: DashMap<String, MockLink>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Link for `host`, created on first use
    pub(crate) fn link(&self, host: &str) -> MockLink {
        self.links
            .entry(host.to_string())
            .or_insert_with(|| MockLink::new(host))
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        _tunnel: Option<Box<dyn TunnelIo>>,
    ) -> Result<Box<dyn RemoteHandle>, SshError> {
        let link = self.link(&target.host);
        link.state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = link.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        link.stall_if_hung().await;

        if !link.state.alive.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed(format!(
                "{}: connection refused",
                target.host
            )));
        }
        let pending_failures = link.state.fail_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            link.state
                .fail_connects
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(SshError::ConnectionFailed(format!(
                "{}: network unreachable",
                target.host
            )));
        }
        if link.state.reject_auth.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed(format!(
                "{} rejected credentials for {}",
                target.host, target.username
            )));
        }
        Ok(link.handle())
    }
}

/// Password target on port 22
pub(crate) fn target(host: &str) -> ConnectTarget {
    ConnectTarget::new(host, 22, "tester", super::config::AuthMethod::password("secret"))
}
