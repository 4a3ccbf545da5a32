//! Job routing.
//!
//! Finds the RPC address of the node a job is assigned to with an
//! `rpc-config` query and issues the run or stop call against it.

use crate::gossip::{GossipError, QueryParams};
use crate::membership::Membership;
use crate::query::QUERY_RPC_CONFIG;
use crate::remote::{RpcConnector, RpcError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use udup_core::Job;

/// Default window for the RPC address query
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Routing errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The address query could not be issued
    #[error("RPC address query failed: {0}")]
    Query(#[from] GossipError),

    /// Nobody answered the address query
    #[error("No RPC address received from node {0}")]
    NoRpcAddress(String),

    /// The answer was not an address
    #[error("Invalid RPC address from node {node}: {reason}")]
    InvalidAddress {
        /// Responding node
        node: String,
        /// Decode failure
        reason: String,
    },

    /// The remote call failed
    #[error("Remote call failed: {0}")]
    Rpc(#[from] RpcError),
}

/// Routes run and stop requests to the node that owns the job
pub struct JobRouter {
    membership: Membership,
    connector: Arc<dyn RpcConnector>,
    query_timeout: Duration,
}

impl JobRouter {
    /// Create a router
    #[must_use]
    pub fn new(membership: Membership, connector: Arc<dyn RpcConnector>) -> Self {
        Self {
            membership,
            connector,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Set the address query window
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// RPC address advertised by `node`
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or `node` does not answer
    pub async fn query_rpc_config(&self, node: &str) -> Result<String, RouterError> {
        let mut responses = self
            .membership
            .query(QUERY_RPC_CONFIG, Vec::new(), QueryParams::node(node, self.query_timeout))
            .await?;

        let Some(response) = responses.recv().await else {
            return Err(RouterError::NoRpcAddress(node.to_string()));
        };
        let address = String::from_utf8(response.payload).map_err(|e| RouterError::InvalidAddress {
            node: response.from.clone(),
            reason: e.to_string(),
        })?;
        debug!(node = %response.from, addr = %address, "Received RPC address");
        Ok(address)
    }

    /// Start `job` on its assigned node
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be resolved or the call fails
    pub async fn invoke_job(&self, mut job: Job) -> Result<(), RouterError> {
        job.success = true;
        let address = self.query_rpc_config(&job.node_name).await?;
        self.connector.connect(&address).call_run_job(&job).await?;
        Ok(())
    }

    /// Stop `job` on its assigned node
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be resolved or the call fails
    pub async fn stop_job(&self, mut job: Job) -> Result<(), RouterError> {
        job.success = true;
        let address = self.query_rpc_config(&job.node_name).await?;
        self.connector.connect(&address).call_stop_job(&job).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::{Event, GossipConfig};
    use crate::mesh::LocalMesh;
    use crate::remote::JobRpc;
    use async_trait::async_trait;
    use tokio::sync::{Mutex, mpsc};

    #[derive(Default)]
    struct RecordingConnector {
        calls: Arc<Mutex<Vec<(String, String, Job)>>>,
    }

    struct RecordingClient {
        address: String,
        calls: Arc<Mutex<Vec<(String, String, Job)>>>,
    }

    #[async_trait]
    impl JobRpc for RecordingClient {
        async fn call_run_job(&self, job: &Job) -> Result<(), RpcError> {
            self.calls
                .lock()
                .await
                .push((self.address.clone(), "run".to_string(), job.clone()));
            Ok(())
        }

        async fn call_stop_job(&self, job: &Job) -> Result<(), RpcError> {
            self.calls
                .lock()
                .await
                .push((self.address.clone(), "stop".to_string(), job.clone()));
            Ok(())
        }
    }

    impl RpcConnector for RecordingConnector {
        fn connect(&self, address: &str) -> Arc<dyn JobRpc> {
            Arc::new(RecordingClient {
                address: address.to_string(),
                calls: Arc::clone(&self.calls),
            })
        }
    }

    async fn node(mesh: &Arc<LocalMesh>, name: &str, port: u16) -> (Membership, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let gossip = mesh.create(GossipConfig::new(name, addr, tx)).await.unwrap();
        (Membership::with_gossip(name, Arc::new(gossip)), rx)
    }

    fn answer_rpc_config(mut events: mpsc::Receiver<Event>, address: &'static str) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Event::Query(query) = event {
                    let (_, sink) = query.into_parts();
                    let _ = sink.respond(address.as_bytes().to_vec());
                }
            }
        });
    }

    #[tokio::test]
    async fn test_invoke_job_routes_to_resolved_address() {
        let mesh = LocalMesh::new();
        let (m1, _e1) = node(&mesh, "n1", 7201).await;
        let (_m2, e2) = node(&mesh, "n2", 7202).await;
        m1.join(&["127.0.0.1:7202".to_string()], true).await.unwrap();
        answer_rpc_config(e2, "127.0.0.1:9100");

        let connector = Arc::new(RecordingConnector::default());
        let calls = Arc::clone(&connector.calls);
        let router = JobRouter::new(m1, connector).with_query_timeout(Duration::from_secs(1));

        router.invoke_job(Job::new("j1").with_node("n2")).await.unwrap();
        router.stop_job(Job::new("j1").with_node("n2")).await.unwrap();

        let calls = calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "127.0.0.1:9100");
        assert_eq!(calls[0].1, "run");
        assert!(calls[0].2.success);
        assert_eq!(calls[1].1, "stop");
    }

    #[tokio::test]
    async fn test_unanswered_address_query() {
        let mesh = LocalMesh::new();
        let (m1, _e1) = node(&mesh, "n1", 7211).await;
        let router = JobRouter::new(m1, Arc::new(RecordingConnector::default()))
            .with_query_timeout(Duration::from_millis(50));

        let err = router.invoke_job(Job::new("j1").with_node("ghost")).await.unwrap_err();
        assert!(matches!(err, RouterError::NoRpcAddress(node) if node == "ghost"));
    }
}
