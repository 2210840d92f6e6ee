//! OxideTerm Core - connection pool, link recovery and node routing
//!
//! The engine behind OxideTerm's session tree: a pool of long-lived SSH
//! connections, heartbeat-driven failure detection, backoff reconnection that
//! cascades through tunneled connections, and a node router that lets the UI
//! address everything by a stable node id.
//!
//! ```text
//!  UI (node ids) ──► commands ──► NodeRouter ──► SshConnectionRegistry ──► ConnectionEntry
//!                                   │                  ▲      ▲
//!                                   │                  │      └── heartbeat / reconnect tasks
//!                                   ▼                  │
//!                            NodeEventEmitter ◄────────┘  (NodeStateEvent + generation)
//! ```

pub mod commands;
pub mod config;
pub mod router;
pub mod session;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use commands::CoreState;

/// Initialize logging
///
/// Honors `RUST_LOG`, falls back to `info`. Safe to call once per process;
/// a second call is ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
