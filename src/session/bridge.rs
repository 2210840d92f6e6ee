//! Terminal endpoint provider
//!
//! The presentation layer reaches an interactive session through an endpoint
//! (local port + one-time token). `TerminalBridge` is the seam; the router only
//! needs attach / detach / liveness.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

/// Token structure: 32 bytes random + 8 bytes timestamp
const TOKEN_RANDOM_LEN: usize = 32;
const TOKEN_TIMESTAMP_LEN: usize = 8;
const TOKEN_TOTAL_LEN: usize = TOKEN_RANDOM_LEN + TOKEN_TIMESTAMP_LEN;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Session already attached: {0}")]
    AlreadyAttached(String),

    #[error("Bridge unavailable: {0}")]
    Unavailable(String),
}

/// Where a terminal client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeAttachment {
    pub port: u16,
    pub token: String,
}

#[async_trait]
pub trait TerminalBridge: Send + Sync + 'static {
    /// Expose `session_id` and return where to reach it
    async fn attach(&self, session_id: &str) -> Result<BridgeAttachment, BridgeError>;

    async fn detach(&self, session_id: &str);

    fn is_attached(&self, session_id: &str) -> bool;
}

/// Format: Base64(random[32] || timestamp[8])
fn generate_token() -> String {
    let mut data = [0u8; TOKEN_TOTAL_LEN];
    rand::rngs::OsRng.fill_bytes(&mut data[..TOKEN_RANDOM_LEN]);
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    data[TOKEN_RANDOM_LEN..].copy_from_slice(&now.to_be_bytes());
    URL_SAFE_NO_PAD.encode(data)
}

/// Bridge that hands out a token per session on one fixed local port
///
/// The listener itself lives in the presentation layer; this type only
/// issues and validates credentials for it.
pub struct TokenBridge {
    port: u16,
    tokens: DashMap<String, String>,
}

impl TokenBridge {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            tokens: DashMap::new(),
        }
    }

    /// Constant-time comparison of the random portion
    pub fn validate(&self, session_id: &str, received: &str) -> bool {
        let Some(expected) = self.tokens.get(session_id).map(|t| t.value().clone()) else {
            return false;
        };
        let received = received.trim();
        if received.len() != expected.len() {
            return false;
        }
        let (Ok(received), Ok(expected)) = (
            URL_SAFE_NO_PAD.decode(received),
            URL_SAFE_NO_PAD.decode(&expected),
        ) else {
            return false;
        };
        if received.len() != TOKEN_TOTAL_LEN || expected.len() != TOKEN_TOTAL_LEN {
            return false;
        }
        bool::from(received[..TOKEN_RANDOM_LEN].ct_eq(&expected[..TOKEN_RANDOM_LEN]))
    }
}

#[async_trait]
impl TerminalBridge for TokenBridge {
    async fn attach(&self, session_id: &str) -> Result<BridgeAttachment, BridgeError> {
        if self.tokens.contains_key(session_id) {
            return Err(BridgeError::AlreadyAttached(session_id.to_string()));
        }
        let token = generate_token();
        self.tokens.insert(session_id.to_string(), token.clone());
        info!("Bridge attached session {} on port {}", session_id, self.port);
        Ok(BridgeAttachment {
            port: self.port,
            token,
        })
    }

    async fn detach(&self, session_id: &str) {
        if self.tokens.remove(session_id).is_some() {
            debug!("Bridge detached session {}", session_id);
        }
    }

    fn is_attached(&self, session_id: &str) -> bool {
        self.tokens.contains_key(session_id)
    }
}
