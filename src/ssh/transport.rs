//! Transport abstraction
//!
//! The pool never speaks the wire protocol itself. It drives a connection
//! through three seams:
//!
//! - [`Connector`]: establishes an authenticated handle, optionally over a
//!   byte stream tunneled through a parent connection
//! - [`RemoteHandle`]: the live connection, owned exclusively by a handle
//!   owner task (see `handle_owner`)
//! - [`RemoteChannel`] / [`FileTransferChannel`]: channels opened on a handle
//!
//! The `russh` feature provides the SSH implementation; tests use an
//! in-memory one.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::config::ConnectTarget;
use super::error::SshError;

/// Kind of channel to open on a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Interactive session channel (PTY/shell)
    Session,
    /// direct-tcpip channel, used for tunneling and local forwards
    DirectTcpip { host: String, port: u16 },
    /// Short-lived channel used only by the heartbeat
    Probe,
}

/// Byte stream a tunneled connection is carried over
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// One open channel
#[async_trait]
pub trait RemoteChannel: Send + 'static {
    /// Transport-level channel identifier (for logs)
    fn id(&self) -> String;

    async fn close(&mut self) -> Result<(), SshError>;

    /// Turn the channel into a raw byte stream (direct-tcpip tunnels)
    fn into_io(self: Box<Self>) -> Option<Box<dyn TunnelIo>>;
}

/// File-transfer subsystem bound to one channel
#[async_trait]
pub trait FileTransferChannel: Send + 'static {
    /// Canonicalize a remote path
    async fn realpath(&mut self, path: &str) -> Result<String, SshError>;

    async fn close(&mut self) -> Result<(), SshError>;
}

/// A live, authenticated connection
///
/// Only the handle owner task ever touches this object.
#[async_trait]
pub trait RemoteHandle: Send + 'static {
    async fn open_channel(&mut self, kind: ChannelKind) -> Result<Box<dyn RemoteChannel>, SshError>;

    async fn open_file_transfer(&mut self) -> Result<Box<dyn FileTransferChannel>, SshError>;

    /// Liveness probe: open a throwaway channel and close it again
    async fn probe(&mut self) -> Result<(), SshError> {
        let mut channel = self.open_channel(ChannelKind::Probe).await?;
        channel.close().await
    }

    async fn close(&mut self);
}

/// Establishes connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect and authenticate to `target`
    ///
    /// `tunnel` is set for connections carried over a parent connection's
    /// direct-tcpip channel.
    async fn connect(
        &self,
        target: &ConnectTarget,
        tunnel: Option<Box<dyn TunnelIo>>,
    ) -> Result<Box<dyn RemoteHandle>, SshError>;
}
