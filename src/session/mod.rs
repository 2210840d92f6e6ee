//! Session management
//!
//! - `tree`: logical nodes addressed by the UI
//! - `registry`: interactive sessions opened on pooled connections
//! - `bridge`: endpoint provider for interactive sessions

pub mod bridge;
pub mod registry;
pub mod tree;

use std::sync::Arc;

pub use bridge::{BridgeAttachment, BridgeError, TerminalBridge, TokenBridge};
pub use registry::{RegistryError, SessionInfo, SessionRegistry};
pub use tree::{NodeState, SessionNode, SessionTree, TreeError};

/// Shared node store; reads are synchronous so snapshots can be taken under the emit lock
pub type SharedSessionTree = Arc<parking_lot::RwLock<SessionTree>>;
