//! Agent configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use udup_core::{CoreError, CoreResult, Version};

/// Default gossip bind address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8946";
/// Default RPC port
pub const DEFAULT_RPC_PORT: u16 = 8191;
/// Default snapshot location, relative to the working directory
pub const DEFAULT_SNAPSHOT_PATH: &str = "serf/snapshot";

/// Leadership campaign tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Lifetime of the leader lock without renewal
    pub leader_ttl_ms: u64,
    /// Pause between a failed campaign and the next attempt
    pub recover_interval_ms: u64,
    /// Stop campaigning after this many attempts (unbounded when absent)
    pub max_attempts: Option<u32>,
}

impl ElectionConfig {
    /// Leader TTL as a duration
    #[must_use]
    pub fn leader_ttl(&self) -> Duration {
        Duration::from_millis(self.leader_ttl_ms)
    }

    /// Recovery interval as a duration
    #[must_use]
    pub fn recover_interval(&self) -> Duration {
        Duration::from_millis(self.recover_interval_ms)
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_ttl_ms: 20_000,
            recover_interval_ms: 10_000,
            max_attempts: None,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Cluster-unique node name
    pub node_name: String,
    /// Region tag
    pub region: String,
    /// Datacenter tag
    pub datacenter: String,
    /// Agent version advertised to peers
    pub version: String,
    /// Whether this node runs the store, scheduler and RPC listener
    pub server: bool,
    /// Gossip bind address, `ip:port`
    pub bind_addr: String,
    /// Network interface to bind gossip traffic to
    pub interface: Option<String>,
    /// Port of the RPC listener
    pub rpc_port: u16,
    /// Address of the HTTP surface
    pub http_addr: String,
    /// Peers to join at startup
    pub start_join: Vec<String>,
    /// Membership snapshot file
    pub snapshot_path: PathBuf,
    /// Override for the failed-member reconnect interval
    pub reconnect_interval_ms: Option<u64>,
    /// Override for how long failed members are retried before being reaped
    pub reconnect_timeout_ms: Option<u64>,
    /// Override for how long left members are remembered
    pub tombstone_timeout_ms: Option<u64>,
    /// Disable automatic node name conflict resolution
    pub disable_name_resolution: bool,
    /// Rejoin the snapshot peers even after a graceful leave
    pub rejoin_after_leave: bool,
    /// Leadership campaign tuning
    pub election: ElectionConfig,
}

impl AgentConfig {
    /// Create a configuration for the named node
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Mark as a server node
    #[must_use]
    pub fn with_server(mut self, server: bool) -> Self {
        self.server = server;
        self
    }

    /// Set the gossip bind address
    #[must_use]
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Set the RPC port
    #[must_use]
    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    /// Add a peer to join at startup
    #[must_use]
    pub fn with_join(mut self, addr: impl Into<String>) -> Self {
        self.start_join.push(addr.into());
        self
    }

    /// Parsed protocol version
    ///
    /// # Errors
    ///
    /// Returns error if `version` is not `major.minor.patch`
    pub fn protocol_version(&self) -> CoreResult<Version> {
        Version::parse(&self.version).map_err(|e| CoreError::validation("version", e.to_string()))
    }

    /// Reject configurations the agent cannot start with
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> CoreResult<()> {
        if self.node_name.trim().is_empty() {
            return Err(CoreError::validation("node_name", "must not be empty"));
        }
        if self.election.leader_ttl_ms == 0 {
            return Err(CoreError::validation("election.leader_ttl_ms", "must be positive"));
        }
        if self.election.recover_interval_ms == 0 {
            return Err(CoreError::validation(
                "election.recover_interval_ms",
                "must be positive",
            ));
        }
        if self.election.max_attempts == Some(0) {
            return Err(CoreError::validation("election.max_attempts", "must be positive"));
        }
        self.protocol_version()?;
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "udup-agent".to_string()),
            region: "global".to_string(),
            datacenter: "dc1".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: false,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            interface: None,
            rpc_port: DEFAULT_RPC_PORT,
            http_addr: "127.0.0.1:8190".to_string(),
            start_join: Vec::new(),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            reconnect_interval_ms: None,
            reconnect_timeout_ms: None,
            tombstone_timeout_ms: None,
            disable_name_resolution: false,
            rejoin_after_leave: false,
            election: ElectionConfig::default(),
        }
    }
}
