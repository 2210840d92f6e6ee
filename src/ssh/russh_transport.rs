//! russh-backed transport
//!
//! `RusshConnector` dials TCP directly or runs the SSH handshake over a
//! tunnel stream (a parent connection's direct-tcpip channel). The file
//! transfer capability is an `sftp` subsystem served by russh-sftp.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, ChannelId, Disconnect};
use russh_sftp::client::SftpSession;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, ConnectTarget};
use super::error::SshError;
use super::transport::{
    ChannelKind, Connector, FileTransferChannel, RemoteChannel, RemoteHandle, TunnelIo,
};

/// russh transport keepalive; liveness is decided by the pool heartbeat
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Client handler for russh callbacks
///
/// Host keys are checked against the target's pinned fingerprint when one is
/// configured.
pub struct ClientHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
}

impl ClientHandler {
    fn new(target: &ConnectTarget) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            pinned_fingerprint: target.host_key_fingerprint.clone(),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match self.pinned_fingerprint.as_deref() {
            Some(expected) if expected != actual => Err(SshError::HostKeyRejected(format!(
                "key for {}:{} has changed (expected {}, got {})",
                self.host, self.port, expected, actual
            ))),
            Some(_) => Ok(true),
            None => {
                debug!(
                    "Accepting unpinned host key {} for {}:{}",
                    actual, self.host, self.port
                );
                Ok(true)
            }
        }
    }
}

/// Connector speaking SSH through russh
#[derive(Default)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            // Disabled: app-level heartbeat handles liveness
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        target: &ConnectTarget,
    ) -> Result<(), SshError> {
        let authenticated = match &target.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&target.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "{}@{} rejected by server",
                target.username, target.host
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        tunnel: Option<Box<dyn TunnelIo>>,
    ) -> Result<Box<dyn RemoteHandle>, SshError> {
        let handler = ClientHandler::new(target);
        let config = Self::client_config();

        let mut handle = match tunnel {
            Some(stream) => {
                debug!("SSH handshake to {} over tunnel", target.key());
                client::connect_stream(config, stream, handler).await?
            }
            None => {
                let addr = format!("{}:{}", target.host, target.port);
                info!("Connecting to SSH server at {}", addr);
                let socket_addr = tokio::net::lookup_host(&addr)
                    .await
                    .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}: {}", addr, e)))?
                    .next()
                    .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))?;
                client::connect(config, socket_addr, handler).await?
            }
        };

        Self::authenticate(&mut handle, target).await?;
        info!("SSH authentication successful for {}", target.key());

        Ok(Box::new(RusshHandle { handle }))
    }
}

struct RusshHandle {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl RemoteHandle for RusshHandle {
    async fn open_channel(&mut self, kind: ChannelKind) -> Result<Box<dyn RemoteChannel>, SshError> {
        let channel = match &kind {
            ChannelKind::Session | ChannelKind::Probe => self.handle.channel_open_session().await?,
            ChannelKind::DirectTcpip { host, port } => {
                self.handle
                    .channel_open_direct_tcpip(host.as_str(), u32::from(*port), "127.0.0.1", 0)
                    .await?
            }
        };
        Ok(Box::new(RusshChannel {
            id: channel.id(),
            channel: Some(channel),
        }))
    }

    async fn open_file_transfer(&mut self) -> Result<Box<dyn FileTransferChannel>, SshError> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::SubsystemUnavailable(format!("sftp: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::SubsystemUnavailable(e.to_string()))?;
        Ok(Box::new(RusshFileTransfer { sftp }))
    }

    /// keepalive@openssh.com with want_reply, no channel churn on the server
    async fn probe(&mut self) -> Result<(), SshError> {
        self.handle.send_keepalive(true).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}

struct RusshChannel {
    id: ChannelId,
    channel: Option<Channel<client::Msg>>,
}

#[async_trait]
impl RemoteChannel for RusshChannel {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if let Some(channel) = self.channel.take() {
            channel.close().await?;
        }
        Ok(())
    }

    fn into_io(mut self: Box<Self>) -> Option<Box<dyn TunnelIo>> {
        let channel = self.channel.take()?;
        Some(Box::new(channel.into_stream()))
    }
}

struct RusshFileTransfer {
    sftp: SftpSession,
}

#[async_trait]
impl FileTransferChannel for RusshFileTransfer {
    async fn realpath(&mut self, path: &str) -> Result<String, SshError> {
        let path = if path.is_empty() { "." } else { path };
        self.sftp.canonicalize(path).await.map_err(|e| match e {
            russh_sftp::client::error::Error::Status(status) => {
                SshError::OperationFailed(format!("{}: {}", path, status.error_message))
            }
            other => SshError::ChannelError(other.to_string()),
        })
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if let Err(e) = self.sftp.close().await {
            warn!("SFTP close failed: {}", e);
        }
        Ok(())
    }
}
