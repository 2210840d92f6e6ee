//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Subsystem not available: {0}")]
    SubsystemUnavailable(String),

    #[error("Remote operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// 不可自动恢复的错误：认证被拒、主机密钥不匹配、密钥无法加载
    ///
    /// 重连循环遇到此类错误立即停止，连接进入 `Error` 终态。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::AuthenticationFailed(_)
                | SshError::HostKeyRejected(_)
                | SshError::KeyError(_)
                | SshError::Unsupported(_)
        )
    }

    /// 通道已不可用（需要重建能力），区别于远端业务失败
    pub fn is_channel_broken(&self) -> bool {
        matches!(
            self,
            SshError::ChannelError(_)
                | SshError::Disconnected
                | SshError::IoError(_)
                | SshError::ProtocolError(_)
        )
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::IoError(err.to_string())
    }
}

#[cfg(feature = "russh")]
impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            russh::Error::IO(e) => SshError::IoError(e.to_string()),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

#[cfg(feature = "russh")]
impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
