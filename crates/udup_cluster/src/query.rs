//! Cluster queries.
//!
//! A [`Query`] pairs the request with a single-use [`ResponseSink`]. Because
//! `respond` consumes the sink, a query can be answered at most once.

use std::fmt;
use tokio::sync::oneshot;
use udup_core::LogicalTime;

/// Wire name of the scheduler restart query
pub const QUERY_SCHEDULER_RESTART: &str = "scheduler-restart";
/// Wire name of the run job query
pub const QUERY_RUN_JOB: &str = "run-job";
/// Wire name of the stop job query
pub const QUERY_STOP_JOB: &str = "stop-job";
/// Wire name of the RPC address query
pub const QUERY_RPC_CONFIG: &str = "rpc-config";

/// Known query kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Reload the job set into the scheduler
    SchedulerRestart,
    /// Start a job on the receiving node
    RunJob,
    /// Stop a job on the receiving node
    StopJob,
    /// Ask a server for its RPC address
    RpcConfig,
    /// Any other name
    Unrecognized(String),
}

impl QueryKind {
    /// Classify a wire name
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            QUERY_SCHEDULER_RESTART => Self::SchedulerRestart,
            QUERY_RUN_JOB => Self::RunJob,
            QUERY_STOP_JOB => Self::StopJob,
            QUERY_RPC_CONFIG => Self::RpcConfig,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    /// Wire name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::SchedulerRestart => QUERY_SCHEDULER_RESTART,
            Self::RunJob => QUERY_RUN_JOB,
            Self::StopJob => QUERY_STOP_JOB,
            Self::RpcConfig => QUERY_RPC_CONFIG,
            Self::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Query errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Response over the size limit
    #[error("Response of {size} bytes exceeds limit of {limit} bytes")]
    ResponseTooLarge {
        /// Response size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// The issuer stopped waiting
    #[error("Query issuer is no longer listening")]
    Closed,
}

/// Single-use response channel back to the query issuer
#[derive(Debug)]
pub struct ResponseSink {
    tx: oneshot::Sender<Vec<u8>>,
    limit: usize,
}

impl ResponseSink {
    /// Create a sink and the receiver the transport forwards from
    #[must_use]
    pub fn channel(limit: usize) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx, limit }, rx)
    }

    /// Send the response
    ///
    /// # Errors
    ///
    /// Returns error if the payload is too large or the issuer is gone
    pub fn respond(self, payload: Vec<u8>) -> Result<(), QueryError> {
        if payload.len() > self.limit {
            return Err(QueryError::ResponseTooLarge {
                size: payload.len(),
                limit: self.limit,
            });
        }
        self.tx.send(payload).map_err(|_| QueryError::Closed)
    }
}

/// Request half of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Classified kind
    pub kind: QueryKind,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Issue time
    pub ltime: LogicalTime,
}

/// Inbound query
#[derive(Debug)]
pub struct Query {
    request: QueryRequest,
    sink: ResponseSink,
}

impl Query {
    /// Create a query
    #[must_use]
    pub fn new(name: &str, payload: Vec<u8>, ltime: LogicalTime, sink: ResponseSink) -> Self {
        Self {
            request: QueryRequest {
                kind: QueryKind::from_name(name),
                payload,
                ltime,
            },
            sink,
        }
    }

    /// Wire name
    #[must_use]
    pub fn name(&self) -> &str {
        self.request.kind.name()
    }

    /// Classified kind
    #[must_use]
    pub fn kind(&self) -> &QueryKind {
        &self.request.kind
    }

    /// Opaque payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.request.payload
    }

    /// Issue time
    #[must_use]
    pub fn ltime(&self) -> LogicalTime {
        self.request.ltime
    }

    /// Split into the request and its response sink
    #[must_use]
    pub fn into_parts(self) -> (QueryRequest, ResponseSink) {
        (self.request, self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(QueryKind::from_name("scheduler-restart"), QueryKind::SchedulerRestart);
        assert_eq!(QueryKind::from_name("run-job"), QueryKind::RunJob);
        assert_eq!(QueryKind::from_name("stop-job"), QueryKind::StopJob);
        assert_eq!(QueryKind::from_name("rpc-config"), QueryKind::RpcConfig);
        assert_eq!(
            QueryKind::from_name("reboot"),
            QueryKind::Unrecognized("reboot".to_string())
        );
    }

    #[test]
    fn test_kind_name_roundtrip() {
        for name in ["scheduler-restart", "run-job", "stop-job", "rpc-config", "other"] {
            assert_eq!(QueryKind::from_name(name).name(), name);
        }
    }

    #[tokio::test]
    async fn test_respond_delivers_once() {
        let (sink, rx) = ResponseSink::channel(16);
        let query = Query::new("run-job", b"{}".to_vec(), LogicalTime::from_raw(4), sink);
        assert_eq!(query.kind(), &QueryKind::RunJob);
        assert_eq!(query.ltime(), LogicalTime::from_raw(4));

        let (request, sink) = query.into_parts();
        assert_eq!(request.payload, b"{}");
        sink.respond(b"ok".to_vec()).unwrap();
        assert_eq!(rx.await.unwrap(), b"ok");
    }

    #[test]
    fn test_respond_rejects_oversized() {
        let (sink, _rx) = ResponseSink::channel(2);
        let err = sink.respond(b"too long".to_vec()).unwrap_err();
        assert_eq!(err, QueryError::ResponseTooLarge { size: 8, limit: 2 });
    }

    #[test]
    fn test_respond_after_issuer_gone() {
        let (sink, rx) = ResponseSink::channel(16);
        drop(rx);
        assert_eq!(sink.respond(b"late".to_vec()), Err(QueryError::Closed));
    }
}
