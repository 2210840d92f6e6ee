//! SSH module - pooled connections and their recovery
//!
//! # Features
//! - Connection pool with reference counting and idle timeout (see `connection_registry`)
//! - Tunneled connections through a parent connection's direct-tcpip channel
//! - Heartbeat-driven link-down detection (see `heartbeat`)
//! - Backoff reconnection with cascade to tunneled descendants (see `reconnect`)
//! - Lazily created file-transfer capability per connection (see `file_transfer`)
//!
//! The wire protocol sits behind the traits in `transport`; the `russh`
//! feature provides the real implementation.

mod config;
pub mod connection_registry;
mod error;
pub mod events;
pub mod file_transfer;
pub(crate) mod handle_owner;
mod heartbeat;
pub mod reconnect;
#[cfg(feature = "russh")]
pub mod russh_transport;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;

pub use config::{AuthMethod, ConnectTarget};
pub use connection_registry::{
    ConnectionEntry, ConnectionInfo, ConnectionPoolStats, ConnectionRegistryError,
    ConnectionState, SshConnectionRegistry,
};
pub use error::SshError;
pub use events::PoolEvent;
pub use file_transfer::{AcquireOutcome, CapabilityHandle, FileTransferCapability};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use reconnect::{JobStatus, ReconnectJob};
#[cfg(feature = "russh")]
pub use russh_transport::RusshConnector;
pub use transport::{
    ChannelKind, Connector, FileTransferChannel, RemoteChannel, RemoteHandle, TunnelIo,
};
