//! Gossip membership contract.
//!
//! The coordination layer consumes gossip through the [`Gossip`] trait. Two
//! back-ends implement it: [`crate::udp::UdpGossip`] for real clusters and
//! [`crate::mesh::LocalMesh`] for in-process clusters.

use crate::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Member liveness as seen through gossip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Member is reachable
    Alive,
    /// Member announced a graceful leave that has not propagated yet
    Leaving,
    /// Member left gracefully
    Left,
    /// Member stopped answering probes
    Failed,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Alive => "alive",
            Self::Leaving => "leaving",
            Self::Left => "left",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Node name
    pub name: String,
    /// Gossip address
    pub addr: SocketAddr,
    /// Advertised tags
    pub tags: BTreeMap<String, String>,
    /// Liveness
    pub status: MemberStatus,
}

impl Member {
    /// Create an alive member without tags
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            tags: BTreeMap::new(),
            status: MemberStatus::Alive,
        }
    }

    /// Set the tags
    #[must_use]
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the status
    #[must_use]
    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Check if member is alive
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }

    /// Look up a tag
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberEventKind {
    /// Members joined
    Join,
    /// Members left gracefully
    Leave,
    /// Members failed
    Failed,
    /// Members changed their tags
    Update,
    /// Members were removed from the member list
    Reap,
}

impl fmt::Display for MemberEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Join => "member-join",
            Self::Leave => "member-leave",
            Self::Failed => "member-failed",
            Self::Update => "member-update",
            Self::Reap => "member-reap",
        };
        f.write_str(s)
    }
}

/// Batch of members affected by the same change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    /// Change kind
    pub kind: MemberEventKind,
    /// Affected members
    pub members: Vec<Member>,
}

/// Inbound gossip event
#[derive(Debug)]
pub enum Event {
    /// Membership change
    Member(MemberEvent),
    /// Addressable query
    Query(Query),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Member(event) => write!(f, "{}", event.kind),
            Self::Query(query) => write!(f, "query: {}", query.name()),
        }
    }
}

/// Scope and lifetime of an issued query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    /// Only these nodes receive the query; every alive node when empty
    pub filter_nodes: Vec<String>,
    /// How long responses are collected
    pub timeout: Duration,
}

impl QueryParams {
    /// Query every alive member
    #[must_use]
    pub fn broadcast(timeout: Duration) -> Self {
        Self {
            filter_nodes: Vec::new(),
            timeout,
        }
    }

    /// Query a single member
    #[must_use]
    pub fn node(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            filter_nodes: vec![name.into()],
            timeout,
        }
    }

    /// Whether `name` is in scope
    #[must_use]
    pub fn targets(&self, name: &str) -> bool {
        self.filter_nodes.is_empty() || self.filter_nodes.iter().any(|n| n == name)
    }
}

/// Response to an issued query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResponse {
    /// Responding node
    pub from: String,
    /// Response body
    pub payload: Vec<u8>,
}

/// Gossip errors
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// Socket failure
    #[error("Gossip I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding failure
    #[error("Gossip encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// No peer answered a join
    #[error("Failed to join any of {attempted} address(es)")]
    JoinFailed {
        /// Number of addresses tried
        attempted: usize,
    },

    /// Query payload over the size limit
    #[error("Query payload of {size} bytes exceeds limit of {limit} bytes")]
    QueryTooLarge {
        /// Payload size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Another live member already holds this name
    #[error("Node name {0} is already in use")]
    NameConflict(String),

    /// The instance has been shut down
    #[error("Gossip instance is shut down")]
    ShutDown,
}

/// Gossip configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Local node name
    pub node_name: String,
    /// Local bind address
    pub bind_addr: SocketAddr,
    /// Tags advertised to peers
    pub tags: BTreeMap<String, String>,
    /// Snapshot file for rejoining after restarts
    pub snapshot_path: Option<PathBuf>,
    /// Maximum query payload size
    pub query_size_limit: usize,
    /// Maximum query response size
    pub query_response_size_limit: usize,
    /// Maximum delay before delivering a batch of member events
    pub coalesce_period: Duration,
    /// Quiet time that flushes a batch of member events early
    pub quiescent_period: Duration,
    /// Maximum delay before delivering a batch of user events
    pub user_coalesce_period: Duration,
    /// Quiet time that flushes a batch of user events early
    pub user_quiescent_period: Duration,
    /// Interval between reconnect attempts to failed members
    pub reconnect_interval: Duration,
    /// How long failed members are retried before being reaped
    pub reconnect_timeout: Duration,
    /// How long left members are remembered before being reaped
    pub tombstone_timeout: Duration,
    /// Interval between liveness probes
    pub probe_interval: Duration,
    /// Silence after which a member is declared failed
    pub suspect_timeout: Duration,
    /// Default query response window
    pub query_timeout: Duration,
    /// Resolve duplicate node names instead of accepting both
    pub enable_name_conflict_resolution: bool,
    /// Rejoin snapshot peers even after a graceful leave
    pub rejoin_after_leave: bool,
    /// Sink for every event delivered by the instance
    pub event_tx: mpsc::Sender<Event>,
}

impl GossipConfig {
    /// Create a configuration with WAN-friendly defaults
    #[must_use]
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr, event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            tags: BTreeMap::new(),
            snapshot_path: None,
            query_size_limit: 1024,
            query_response_size_limit: 1024,
            coalesce_period: Duration::ZERO,
            quiescent_period: Duration::ZERO,
            user_coalesce_period: Duration::ZERO,
            user_quiescent_period: Duration::ZERO,
            reconnect_interval: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(24 * 3600),
            tombstone_timeout: Duration::from_secs(24 * 3600),
            probe_interval: Duration::from_secs(5),
            suspect_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            enable_name_conflict_resolution: true,
            rejoin_after_leave: false,
            event_tx,
        }
    }
}

/// Gossip membership mesh
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Join the cluster through any of `addrs`; returns how many answered.
    ///
    /// With `ignore_old`, queries issued before the join are not delivered.
    async fn join(&self, addrs: &[String], ignore_old: bool) -> Result<usize, GossipError>;

    /// Every known member, including the local one
    async fn members(&self) -> Vec<Member>;

    /// The local member
    async fn local_member(&self) -> Member;

    /// Issue a query; responses arrive on the returned channel until the timeout
    async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParams,
    ) -> Result<mpsc::Receiver<NodeResponse>, GossipError>;

    /// Leave the cluster gracefully and stop
    async fn leave(&self) -> Result<(), GossipError>;

    /// Cancelled once the instance stops
    fn shutdown_token(&self) -> CancellationToken;
}
