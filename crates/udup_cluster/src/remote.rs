//! Remote job calls over TCP.
//!
//! One JSON document per line in each direction: the client writes an
//! [`RpcRequest`] and reads back one [`RpcReply`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use udup_core::{CoreResult, Job};

const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default call timeout in milliseconds
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Connection failed
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Timeout
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// Framing error
    #[error("Framing error: {0}")]
    Codec(#[from] LinesCodecError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer closed the connection before replying
    #[error("Connection closed before reply")]
    Closed,

    /// The call reached the peer and failed there
    #[error("Remote error: {0}")]
    Remote(String),

    /// Listener I/O error
    #[error("RPC I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote call request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "job", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Start a job
    RunJob(Job),
    /// Stop a job
    StopJob(Job),
}

/// Remote call reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcReply {
    /// Whether the call succeeded
    pub success: bool,
    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    /// Create a successful reply
    #[must_use]
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Create a failed reply
    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Client side of the remote call interface
#[async_trait]
pub trait JobRpc: Send + Sync {
    /// Start `job` on the remote node
    async fn call_run_job(&self, job: &Job) -> Result<(), RpcError>;

    /// Stop `job` on the remote node
    async fn call_stop_job(&self, job: &Job) -> Result<(), RpcError>;
}

/// Builds a client for an RPC address
pub trait RpcConnector: Send + Sync {
    /// Client bound to `address` (`host:port`)
    fn connect(&self, address: &str) -> Arc<dyn JobRpc>;
}

/// Connector producing [`RemoteClient`]s
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    timeout_ms: u64,
}

impl TcpConnector {
    /// Create a connector with the default call timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcConnector for TcpConnector {
    fn connect(&self, address: &str) -> Arc<dyn JobRpc> {
        Arc::new(RemoteClient::new(address).with_timeout(self.timeout_ms))
    }
}

/// Remote call client
#[derive(Debug, Clone)]
pub struct RemoteClient {
    /// Target address
    address: String,
    /// Request timeout in milliseconds
    timeout_ms: u64,
}

impl RemoteClient {
    /// Create a new remote client
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Target address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for its reply
    ///
    /// # Errors
    ///
    /// Returns error on connection failure, timeout or a failed reply
    pub async fn send(&self, request: RpcRequest) -> Result<(), RpcError> {
        let timeout = Duration::from_millis(self.timeout_ms);
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| RpcError::Timeout(self.timeout_ms))?
    }

    async fn exchange(&self, request: RpcRequest) -> Result<(), RpcError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| RpcError::Connect {
                addr: self.address.clone(),
                source,
            })?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        framed.send(serde_json::to_string(&request)?).await?;
        let line = framed.next().await.ok_or(RpcError::Closed)??;
        let reply: RpcReply = serde_json::from_str(&line)?;

        if reply.success {
            Ok(())
        } else {
            Err(RpcError::Remote(reply.error.unwrap_or_default()))
        }
    }
}

#[async_trait]
impl JobRpc for RemoteClient {
    async fn call_run_job(&self, job: &Job) -> Result<(), RpcError> {
        self.send(RpcRequest::RunJob(job.clone())).await
    }

    async fn call_stop_job(&self, job: &Job) -> Result<(), RpcError> {
        self.send(RpcRequest::StopJob(job.clone())).await
    }
}

/// Server side of the remote call interface
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Start a job locally
    async fn run_job(&self, job: Job) -> CoreResult<()>;

    /// Stop a job locally
    async fn stop_job(&self, job: Job) -> CoreResult<()>;
}

/// RPC listener
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn JobHandler>,
}

impl RpcServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn JobHandler>) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "RPC listener started");
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = handle_connection(stream, handler) => {
                                if let Err(e) = result {
                                    debug!(peer = %peer, error = %e, "RPC connection closed with error");
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
            }
        }
        debug!("RPC listener stopped");
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn JobHandler>) -> Result<(), RpcError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = framed.next().await {
        let line = line?;
        let reply = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(RpcRequest::RunJob(job)) => {
                info!(job = %job.name, "RPC run job");
                to_reply(handler.run_job(job).await)
            }
            Ok(RpcRequest::StopJob(job)) => {
                info!(job = %job.name, "RPC stop job");
                to_reply(handler.stop_job(job).await)
            }
            Err(e) => RpcReply::error(format!("invalid request: {}", e)),
        };
        framed.send(serde_json::to_string(&reply)?).await?;
    }
    Ok(())
}

fn to_reply(result: CoreResult<()>) -> RpcReply {
    match result {
        Ok(()) => RpcReply::success(),
        Err(e) => RpcReply::error(e.to_string()),
    }
}
