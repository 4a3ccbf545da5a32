//! Cluster membership layer.
//!
//! Wraps a [`Gossip`] back-end with the agent's configuration: identity
//! tags, snapshot location, query limits and event coalescing. The rest of
//! the agent asks membership questions through [`Membership`] only.

use crate::config::AgentConfig;
use crate::gossip::{Event, Gossip, GossipConfig, GossipError, Member, NodeResponse, QueryParams};
use crate::mesh::LocalMesh;
use crate::store::Store;
use crate::udp::UdpGossip;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use udup_core::CoreError;

/// Tag set to `"true"` on server-capable nodes
pub const SERVER_TAG: &str = "udup_server";
/// Tag carrying the agent version
pub const VERSION_TAG: &str = "udup_version";
/// Tag carrying the role marker
pub const ROLE_TAG: &str = "role";
/// Role marker value
pub const ROLE: &str = "udup";
/// Region tag
pub const REGION_TAG: &str = "region";
/// Datacenter tag
pub const DATACENTER_TAG: &str = "dc";

/// Capacity of the gossip event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Maximum query payload size
pub const QUERY_SIZE_LIMIT: usize = 10 * 1024;
/// Member and user event coalescing window
pub const COALESCE_PERIOD: Duration = Duration::from_secs(6);
/// Quiet time that flushes a coalesced batch early
pub const QUIESCENT_PERIOD: Duration = Duration::from_secs(1);

/// Membership errors
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// Gossip back-end failure
    #[error("Failed to start gossip: {0}")]
    Gossip(#[from] GossipError),

    /// Snapshot directory could not be created
    #[error("Failed to create snapshot directory {path}: {source}")]
    Snapshot {
        /// Directory
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The recorded leader is not in the live member list
    #[error("No member leader found in member list")]
    LeaderNotFound,

    /// Leader lookup in the store failed
    #[error("Failed to read leader from store: {0}")]
    Store(#[from] CoreError),
}

/// Gossip back-end selection
#[derive(Clone)]
pub enum Transport {
    /// UDP gossip on the resolved bind address
    Udp,
    /// Node of an in-process mesh
    Mesh(Arc<LocalMesh>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => f.write_str("Udp"),
            Self::Mesh(_) => f.write_str("Mesh"),
        }
    }
}

/// Handle to the membership layer
#[derive(Clone)]
pub struct Membership {
    node_name: String,
    gossip: Arc<dyn Gossip>,
}

impl Membership {
    /// Start gossip for `config` on `bind`
    ///
    /// Returns the handle and the receiving end of the event channel, which
    /// the event loop consumes.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot directory cannot be created or gossip fails to start
    pub async fn setup(
        config: &AgentConfig,
        bind: SocketAddr,
        transport: Transport,
    ) -> Result<(Self, mpsc::Receiver<Event>), MembershipError> {
        ensure_parent_dir(&config.snapshot_path).await?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let gossip_config = Self::gossip_config(config, bind, event_tx);

        info!(node = %config.node_name, bind = %bind, "Udup agent starting");

        let gossip: Arc<dyn Gossip> = match transport {
            Transport::Udp => Arc::new(UdpGossip::create(gossip_config).await?),
            Transport::Mesh(mesh) => Arc::new(mesh.create(gossip_config).await?),
        };

        Ok((Self::with_gossip(config.node_name.clone(), gossip), event_rx))
    }

    /// Wrap an already running gossip instance
    #[must_use]
    pub fn with_gossip(node_name: impl Into<String>, gossip: Arc<dyn Gossip>) -> Self {
        Self {
            node_name: node_name.into(),
            gossip,
        }
    }

    /// Gossip configuration derived from the agent configuration
    #[must_use]
    pub fn gossip_config(
        config: &AgentConfig,
        bind: SocketAddr,
        event_tx: mpsc::Sender<Event>,
    ) -> GossipConfig {
        let mut gossip = GossipConfig::new(config.node_name.clone(), bind, event_tx);
        gossip.tags = Self::tags(config);
        gossip.snapshot_path = Some(config.snapshot_path.clone());
        gossip.query_size_limit = QUERY_SIZE_LIMIT;
        gossip.query_response_size_limit = QUERY_SIZE_LIMIT;
        gossip.coalesce_period = COALESCE_PERIOD;
        gossip.quiescent_period = QUIESCENT_PERIOD;
        gossip.user_coalesce_period = COALESCE_PERIOD;
        gossip.user_quiescent_period = QUIESCENT_PERIOD;
        if let Some(ms) = config.reconnect_interval_ms.filter(|ms| *ms > 0) {
            gossip.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = config.reconnect_timeout_ms.filter(|ms| *ms > 0) {
            gossip.reconnect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = config.tombstone_timeout_ms.filter(|ms| *ms > 0) {
            gossip.tombstone_timeout = Duration::from_millis(ms);
        }
        gossip.enable_name_conflict_resolution = !config.disable_name_resolution;
        gossip.rejoin_after_leave = config.rejoin_after_leave;
        gossip
    }

    /// Tags advertised for `config`
    #[must_use]
    pub fn tags(config: &AgentConfig) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if config.server {
            tags.insert(SERVER_TAG.to_string(), "true".to_string());
        }
        tags.insert(VERSION_TAG.to_string(), config.version.clone());
        tags.insert(ROLE_TAG.to_string(), ROLE.to_string());
        tags.insert(REGION_TAG.to_string(), config.region.clone());
        tags.insert(DATACENTER_TAG.to_string(), config.datacenter.clone());
        tags
    }

    /// Local node name
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Join the cluster through `addrs`.
    ///
    /// With `replay`, queries issued before the join are still delivered.
    ///
    /// # Errors
    ///
    /// Returns error if no address answered
    pub async fn join(&self, addrs: &[String], replay: bool) -> Result<usize, GossipError> {
        info!(addrs = ?addrs, replay, "Joining cluster");
        let result = self.gossip.join(addrs, !replay).await;
        match &result {
            Ok(n) if *n > 0 => info!(nodes = n, "Joined cluster"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Error joining cluster"),
        }
        result
    }

    /// Every known member
    pub async fn members(&self) -> Vec<Member> {
        self.gossip.members().await
    }

    /// The local member
    pub async fn local_member(&self) -> Member {
        self.gossip.local_member().await
    }

    /// Alive members tagged as servers
    pub async fn list_servers(&self) -> Vec<Member> {
        self.gossip
            .members()
            .await
            .into_iter()
            .filter(|m| m.is_alive() && m.tag(SERVER_TAG) == Some("true"))
            .collect()
    }

    /// Member holding leadership according to `store`
    ///
    /// # Errors
    ///
    /// Returns `LeaderNotFound` if the recorded leader is not a known member
    pub async fn leader_member(&self, store: &dyn Store) -> Result<Member, MembershipError> {
        let Some(leader) = store.get_leader().await? else {
            return Err(MembershipError::LeaderNotFound);
        };
        self.gossip
            .members()
            .await
            .into_iter()
            .find(|m| m.name == leader)
            .ok_or(MembershipError::LeaderNotFound)
    }

    /// Issue a cluster query
    ///
    /// # Errors
    ///
    /// Returns error if the payload is too large or gossip has stopped
    pub async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParams,
    ) -> Result<mpsc::Receiver<NodeResponse>, GossipError> {
        debug!(query = name, targets = ?params.filter_nodes, "Sending query");
        self.gossip.query(name, payload, params).await
    }

    /// Leave the cluster
    ///
    /// # Errors
    ///
    /// Returns error if the leave could not be recorded
    pub async fn leave(&self) -> Result<(), GossipError> {
        self.gossip.leave().await
    }

    /// Cancelled once gossip stops
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.gossip.shutdown_token()
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<(), MembershipError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| MembershipError::Snapshot {
            path: parent.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config(name: &str, port: u16, dir: &Path) -> AgentConfig {
        let mut config = AgentConfig::new(name).with_bind_addr(format!("127.0.0.1:{}", port));
        config.snapshot_path = dir.join(name).join("serf").join("snapshot");
        config
    }

    fn bind(config: &AgentConfig) -> SocketAddr {
        config.bind_addr.parse().unwrap()
    }

    #[test]
    fn test_tags() {
        let config = AgentConfig::new("n1").with_server(true);
        let tags = Membership::tags(&config);
        assert_eq!(tags.get(SERVER_TAG).map(String::as_str), Some("true"));
        assert_eq!(tags.get(ROLE_TAG).map(String::as_str), Some("udup"));
        assert_eq!(tags.get(REGION_TAG).map(String::as_str), Some("global"));
        assert_eq!(tags.get(DATACENTER_TAG).map(String::as_str), Some("dc1"));
        assert_eq!(tags.get(VERSION_TAG), Some(&config.version));

        let client = Membership::tags(&AgentConfig::new("n2"));
        assert!(!client.contains_key(SERVER_TAG));
    }

    #[test]
    fn test_gossip_config_overrides() {
        let mut config = AgentConfig::new("n1");
        config.reconnect_interval_ms = Some(2_000);
        config.tombstone_timeout_ms = Some(0);
        config.disable_name_resolution = true;
        config.rejoin_after_leave = true;
        let (tx, _rx) = mpsc::channel(1);
        let gossip = Membership::gossip_config(&config, "127.0.0.1:7946".parse().unwrap(), tx);

        assert_eq!(gossip.query_size_limit, 10 * 1024);
        assert_eq!(gossip.coalesce_period, Duration::from_secs(6));
        assert_eq!(gossip.quiescent_period, Duration::from_secs(1));
        assert_eq!(gossip.user_coalesce_period, Duration::from_secs(6));
        assert_eq!(gossip.reconnect_interval, Duration::from_secs(2));
        // zero keeps the default
        assert_eq!(gossip.tombstone_timeout, Duration::from_secs(24 * 3600));
        assert!(!gossip.enable_name_conflict_resolution);
        assert!(gossip.rejoin_after_leave);
        assert_eq!(gossip.snapshot_path, Some(config.snapshot_path.clone()));
    }

    #[tokio::test]
    async fn test_setup_creates_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("n1", 7101, dir.path());
        let mesh = LocalMesh::new();
        let (membership, _events) = Membership::setup(&config, bind(&config), Transport::Mesh(mesh))
            .await
            .unwrap();
        assert!(dir.path().join("n1").join("serf").is_dir());
        assert_eq!(membership.node_name(), "n1");
        assert_eq!(membership.local_member().await.tag(ROLE_TAG), Some("udup"));
    }

    #[tokio::test]
    async fn test_list_servers_and_leader_member() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = LocalMesh::new();
        let server = config("s1", 7111, dir.path()).with_server(true);
        let client = config("c1", 7112, dir.path());

        let (m1, _e1) = Membership::setup(&server, bind(&server), Transport::Mesh(Arc::clone(&mesh)))
            .await
            .unwrap();
        let (m2, _e2) = Membership::setup(&client, bind(&client), Transport::Mesh(Arc::clone(&mesh)))
            .await
            .unwrap();
        assert_eq!(m2.join(&["127.0.0.1:7111".to_string()], true).await.unwrap(), 1);

        let servers = m2.list_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "s1");

        let store = MemoryStore::new();
        assert!(matches!(
            m1.leader_member(&store).await,
            Err(MembershipError::LeaderNotFound)
        ));

        store.set_leader("ghost").await;
        assert!(matches!(
            m1.leader_member(&store).await,
            Err(MembershipError::LeaderNotFound)
        ));

        store.set_leader("s1").await;
        assert_eq!(m2.leader_member(&store).await.unwrap().name, "s1");

        mesh.fail("s1").await;
        assert!(m2.list_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_join_with_no_reachable_peer_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("n1", 7121, dir.path());
        let (membership, _events) =
            Membership::setup(&config, bind(&config), Transport::Mesh(LocalMesh::new()))
                .await
                .unwrap();
        assert!(membership.join(&["127.0.0.1:1".to_string()], true).await.is_err());
        assert_eq!(membership.members().await.len(), 1);
    }
}
