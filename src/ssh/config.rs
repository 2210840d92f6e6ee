//! SSH connection target

use serde::{Deserialize, Serialize};

/// Authentication methods supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        AuthMethod::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        AuthMethod::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// 检查两个认证方式是否兼容（可安全复用同一条连接）
    pub fn compatible_with(&self, other: &AuthMethod) -> bool {
        match (self, other) {
            // 密码认证：必须完全相同
            (AuthMethod::Password { password: p1 }, AuthMethod::Password { password: p2 }) => {
                p1 == p2
            }
            // 密钥认证：路径必须相同（passphrase 不比较，因为密钥已加载）
            (AuthMethod::Key { key_path: k1, .. }, AuthMethod::Key { key_path: k2, .. }) => {
                k1 == k2
            }
            _ => false,
        }
    }
}

/// Where to connect, and as whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTarget {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Pinned SHA-256 host key fingerprint; `None` accepts any key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            host_key_fingerprint: None,
        }
    }

    /// Pool key for connection reuse: `user@host:port`
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Same endpoint and identity (host/port/user)
    pub fn same_endpoint(&self, other: &ConnectTarget) -> bool {
        self.host == other.host && self.port == other.port && self.username == other.username
    }

    pub fn display_label(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}
