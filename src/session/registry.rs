//! Interactive Session Registry
//!
//! Bookkeeping for interactive terminal sessions. Each session owns the
//! remote session channel it was opened on and remembers which connection
//! (and which handle epoch of it) backs it, so the router can tell whether a
//! session survived a reconnect.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::router::TerminalEndpoint;
use crate::ssh::RemoteChannel;

/// Default maximum concurrent sessions
const DEFAULT_MAX_SESSIONS: usize = 20;

/// One interactive session
pub struct SessionEntry {
    pub id: String,
    pub node_id: String,
    pub connection_id: String,
    /// Handle epoch of the connection when the channel was opened
    pub handle_epoch: u64,
    pub endpoint: Option<TerminalEndpoint>,
    pub created_at: DateTime<Utc>,
    channel: Mutex<Option<Box<dyn RemoteChannel>>>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            connection_id: self.connection_id.clone(),
            handle_epoch: self.handle_epoch,
            ws_port: self.endpoint.as_ref().map(|e| e.ws_port),
            created_at: self.created_at.to_rfc3339(),
        }
    }

    async fn close_channel(&self) {
        if let Some(mut channel) = self.channel.lock().await.take() {
            let id = channel.id();
            if let Err(e) = channel.close().await {
                debug!("Session {} channel {} close failed: {}", self.id, id, e);
            }
        }
    }
}

/// Serializable session summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub node_id: String,
    pub connection_id: String,
    pub handle_epoch: u64,
    pub ws_port: Option<u16>,
    pub created_at: String,
}

/// Session registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Connection limit reached: {current}/{max}")]
    ConnectionLimitReached { current: usize, max: usize },
}

/// Registry of interactive sessions
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    max_sessions: AtomicUsize,
    /// Serializes the limit check with the insert
    create_lock: parking_lot::Mutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_max_sessions(DEFAULT_MAX_SESSIONS)
    }

    /// Create a new session registry with custom max sessions
    pub fn with_max_sessions(max: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions: AtomicUsize::new(max),
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    /// Register a session over an already opened channel
    pub fn create_session(
        &self,
        node_id: &str,
        connection_id: &str,
        handle_epoch: u64,
        channel: Box<dyn RemoteChannel>,
    ) -> Result<String, RegistryError> {
        let _guard = self.create_lock.lock();

        let current = self.sessions.len();
        let max = self.max_sessions();
        if current >= max {
            return Err(RegistryError::ConnectionLimitReached { current, max });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating session {} for node {} on connection {} (epoch {})",
            session_id, node_id, connection_id, handle_epoch
        );
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                id: session_id.clone(),
                node_id: node_id.to_string(),
                connection_id: connection_id.to_string(),
                handle_epoch,
                endpoint: None,
                created_at: Utc::now(),
                channel: Mutex::new(Some(channel)),
            },
        );
        Ok(session_id)
    }

    pub fn set_endpoint(
        &self,
        session_id: &str,
        endpoint: TerminalEndpoint,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        entry.endpoint = Some(endpoint);
        Ok(())
    }

    /// Execute a function with read access to a session
    pub fn with_session<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&SessionEntry) -> R,
    {
        self.sessions.get(session_id).map(|entry| f(&entry))
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.with_session(session_id, SessionEntry::info)
    }

    pub fn endpoint(&self, session_id: &str) -> Option<TerminalEndpoint> {
        self.with_session(session_id, |e| e.endpoint.clone()).flatten()
    }

    /// Remove a session and close its channel
    pub async fn close_session(&self, session_id: &str) -> Result<(), RegistryError> {
        let (_, entry) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        entry.close_channel().await;
        info!("Session {} closed", session_id);
        Ok(())
    }

    pub fn sessions_for_connection(&self, connection_id: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| e.connection_id == connection_id)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
