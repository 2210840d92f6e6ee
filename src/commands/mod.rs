//! Commands module
//!
//! Async entry points over `CoreState`. Connection commands address the pool
//! by connection id; node commands go through the `NodeRouter` and only take
//! node ids.

pub mod connection;
pub mod node;

pub use connection::*;
pub use node::*;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::{load_pool_config, pool_config_file, ConfigError, PoolConfig};
use crate::router::{NodeEventEmitter, NodeRouter};
use crate::session::{SessionRegistry, SessionTree, SharedSessionTree, TerminalBridge};
use crate::ssh::{Connector, SshConnectionRegistry};

/// Shared state behind every command
pub struct CoreState {
    pub registry: Arc<SshConnectionRegistry>,
    pub router: Arc<NodeRouter>,
    pub tree: SharedSessionTree,
    pub emitter: Arc<NodeEventEmitter>,
    pub sessions: Arc<SessionRegistry>,
    /// Where `set_pool_config` persists; `None` keeps changes in memory
    pub config_path: Option<PathBuf>,
}

impl CoreState {
    pub fn new(
        connector: Arc<dyn Connector>,
        bridge: Arc<dyn TerminalBridge>,
        config: PoolConfig,
    ) -> Self {
        let emitter = Arc::new(NodeEventEmitter::new());
        let registry = SshConnectionRegistry::new(connector, emitter.clone(), config);
        let tree: SharedSessionTree = Arc::new(parking_lot::RwLock::new(SessionTree::new()));
        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(NodeRouter::new(
            tree.clone(),
            registry.clone(),
            sessions.clone(),
            bridge,
            emitter.clone(),
        ));

        Self {
            registry,
            router,
            tree,
            emitter,
            sessions,
            config_path: None,
        }
    }

    /// Build from the on-disk pool config (defaults when the file is missing)
    pub async fn load(
        connector: Arc<dyn Connector>,
        bridge: Arc<dyn TerminalBridge>,
    ) -> Result<Self, ConfigError> {
        let path = pool_config_file()?;
        let config = load_pool_config(&path).await?;
        Ok(Self::new(connector, bridge, config).with_config_path(path))
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Close every pooled connection (process exit)
    pub async fn shutdown(&self) {
        info!("Shutting down core state");
        self.registry.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::router::{NodeReadiness, NodeStateEvent, RouteError};
    use crate::session::TokenBridge;
    use crate::ssh::testing::{target, MockConnector};
    use crate::ssh::ConnectionState;

    fn core() -> (CoreState, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let state = CoreState::new(
            connector.clone(),
            Arc::new(TokenBridge::new(9527)),
            PoolConfig::default(),
        );
        (state, connector)
    }

    /// Next connection-state event for `node`, skipping everything else
    async fn next_state(
        rx: &mut broadcast::Receiver<NodeStateEvent>,
        node: &str,
    ) -> (NodeReadiness, u64, String) {
        loop {
            match rx.recv().await.unwrap() {
                NodeStateEvent::ConnectionStateChanged {
                    node_id,
                    generation,
                    state,
                    reason,
                } if node_id == node => return (state, generation, reason),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure_and_recovery_end_to_end() {
        let (state, connector) = core();
        let link = connector.link("server-a");
        let node = node_add(&state, None, target("server-a")).unwrap();

        let conn_id = node_connect(&state, &node).await.unwrap();
        let entry = state.registry.get_connection(&conn_id).unwrap();
        assert_eq!(entry.ref_count(), 0);

        let slot = node_acquire_sftp(&state, &node).await.unwrap();
        assert_eq!(entry.ref_count(), 1);
        node_terminal_url(&state, &node).await.unwrap();
        assert_eq!(entry.ref_count(), 2);

        let (mut rx, snapshot) = state.router.subscribe_with_snapshot(&node).unwrap();
        let started = tokio::time::Instant::now();
        link.kill();

        let (readiness, link_down_gen, reason) = next_state(&mut rx, &node).await;
        assert_eq!(readiness, NodeReadiness::Connecting);
        assert!(reason.contains("Link down"));
        assert!(link_down_gen > snapshot.generation);
        assert!(started.elapsed() <= Duration::from_secs(30));

        let (readiness, _, reason) = next_state(&mut rx, &node).await;
        assert_eq!(readiness, NodeReadiness::Connecting);
        assert_eq!(reason, "reconnecting");
        assert_eq!(entry.state(), ConnectionState::Reconnecting);

        link.restore();
        let (readiness, ready_gen, _) = next_state(&mut rx, &node).await;
        assert_eq!(readiness, NodeReadiness::Ready);
        assert!(ready_gen > link_down_gen);
        assert_eq!(entry.state(), ConnectionState::Active);
        assert_eq!(entry.handle_epoch(), 1);
        assert_eq!(entry.ref_count(), 2);

        // 同一个逻辑槽位，实例已重建
        let after = node_acquire_sftp(&state, &node).await.unwrap();
        assert_eq!(after, slot);
        assert_eq!(link.file_transfers_opened(), 2);
        assert_eq!(
            node_sftp_realpath(&state, &node, ".").await.unwrap(),
            "/home/server-a"
        );

        let endpoint = node_terminal_url(&state, &node).await.unwrap();
        assert_eq!(
            state.sessions.get(&endpoint.session_id).unwrap().handle_epoch,
            1
        );
        assert_eq!(entry.ref_count(), 2);

        let snapshot = node_get_state(&state, &node).unwrap();
        assert_eq!(snapshot.state.readiness, NodeReadiness::Ready);
        assert!(snapshot.state.sftp_ready);
        assert_eq!(snapshot.state.ws_endpoint, Some(endpoint));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunneled_child_stays_down_until_reresolved() {
        let (state, connector) = core();
        let jump_link = connector.link("jump");
        let jump = node_add(&state, None, target("jump")).unwrap();
        let db = node_add(&state, Some(jump.as_str()), target("db")).unwrap();

        let jump_conn = node_connect(&state, &jump).await.unwrap();
        let db_conn = node_connect(&state, &db).await.unwrap();
        let db_entry = state.registry.get_connection(&db_conn).unwrap();
        assert_eq!(db_entry.parent_connection_id(), Some(jump_conn.as_str()));

        let mut rx = state.emitter.subscribe();
        jump_link.kill();

        let (readiness, _, _) = next_state(&mut rx, &jump).await;
        assert_eq!(readiness, NodeReadiness::Connecting);
        let mut db_rx = rx.resubscribe();
        // 子节点经级联进入 LinkDown
        assert_eq!(db_entry.state(), ConnectionState::LinkDown);
        assert!(!state.registry.has_reconnect_job(&db_conn));

        jump_link.restore();
        loop {
            let (readiness, _, _) = next_state(&mut rx, &jump).await;
            if readiness == NodeReadiness::Ready {
                break;
            }
        }

        // 父连接恢复不会顺带治愈子连接
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(db_entry.state(), ConnectionState::LinkDown);
        assert!(matches!(
            state.router.resolve_connection(&db).await,
            Err(RouteError::NotConnected(_))
        ));
        // 期间只有父节点自身的事件
        while let Ok(event) = db_rx.try_recv() {
            assert_ne!(event.node_id(), db.as_str(), "unexpected {:?}", event);
        }

        assert_eq!(node_reconnect(&state, &db).await.unwrap(), db_conn);
        assert_eq!(db_entry.state(), ConnectionState::Idle);
        let (readiness, _, _) = next_state(&mut db_rx, &db).await;
        assert_eq!(readiness, NodeReadiness::Connecting);
        let (readiness, _, _) = next_state(&mut db_rx, &db).await;
        assert_eq!(readiness, NodeReadiness::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_sftp_init_shares_capability() {
        let (state, connector) = core();
        let node = node_add(&state, None, target("server-a")).unwrap();
        let conn_id = node_connect(&state, &node).await.unwrap();

        let legacy = sftp_init(&state, &conn_id).await.unwrap();
        let via_node = node_acquire_sftp(&state, &node).await.unwrap();
        assert_eq!(legacy.capability_id, via_node);
        assert_eq!(legacy.cwd, "/home/server-a");
        assert_eq!(connector.link("server-a").file_transfers_opened(), 1);
        assert_eq!(
            state.registry.get_connection(&conn_id).unwrap().ref_count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_sftp_close_lets_connection_idle_out() {
        let (state, _) = core();
        let config = PoolConfig {
            idle_timeout_secs: 60,
            ..PoolConfig::default()
        };
        set_pool_config(&state, config).await.unwrap();

        let conn_id = connect(&state, target("server-a")).await.unwrap();
        sftp_init(&state, &conn_id).await.unwrap();
        let entry = state.registry.get_connection(&conn_id).unwrap();
        assert_eq!(entry.ref_count(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(state.registry.get_connection(&conn_id).is_some());

        assert!(sftp_close(&state, &conn_id).await.unwrap());
        assert_eq!(entry.ref_count(), 0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(state.registry.get_connection(&conn_id).is_none());
        assert!(list_connections(&state).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_release_sftp_clears_binding() {
        let (state, _) = core();
        let node = node_add(&state, None, target("server-a")).unwrap();
        let conn_id = node_connect(&state, &node).await.unwrap();

        node_acquire_sftp(&state, &node).await.unwrap();
        assert!(node_get_state(&state, &node).unwrap().state.sftp_ready);

        assert!(node_release_sftp(&state, &node).await.unwrap());
        let snapshot = node_get_state(&state, &node).unwrap();
        assert!(!snapshot.state.sftp_ready);
        assert_eq!(
            state.registry.get_connection(&conn_id).unwrap().ref_count(),
            0
        );
        assert!(state
            .tree
            .read()
            .get_node(&node)
            .unwrap()
            .sftp_session_id
            .is_none());
    }

    #[tokio::test]
    async fn test_set_pool_config_validates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let (state, _) = core();
        let state = state.with_config_path(path.clone());

        let invalid = PoolConfig {
            heartbeat_interval_secs: 0,
            ..PoolConfig::default()
        };
        assert!(set_pool_config(&state, invalid).await.is_err());
        assert!(!path.exists());

        let config = PoolConfig {
            idle_timeout_secs: 60,
            ..PoolConfig::default()
        };
        set_pool_config(&state, config.clone()).await.unwrap();
        assert_eq!(get_pool_config(&state), config);
        assert_eq!(
            crate::config::load_pool_config(&path).await.unwrap(),
            config
        );
        assert_eq!(get_pool_stats(&state).idle_timeout_secs, 60);
    }
}
