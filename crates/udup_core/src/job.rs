//! Job wire model.
//!
//! Jobs are owned by the store and the scheduler; the coordination layer only
//! forwards them between nodes. Field names are PascalCase on the wire so that
//! every agent in a mixed-version cluster decodes the same JSON.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A job as seen by the coordination layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    /// Cluster-unique job name
    pub name: String,
    /// Node the job is assigned to
    pub node_name: String,
    /// Outcome flag, set speculatively when the job is dispatched
    pub success: bool,
    /// Execution parameters, kept verbatim
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Job {
    /// Create a job with no assignment and no parameters
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Assign the job to a node
    #[must_use]
    pub fn with_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    /// Attach an opaque execution parameter
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if a parameter cannot be serialized
    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a job object
    pub fn from_json(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload of the `run-job` and `stop-job` queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunQueryParam {
    /// Job to start or stop
    pub job: Job,
    /// RPC address of the issuing server, if it advertised one
    #[serde(rename = "RPCAddr", default, skip_serializing_if = "Option::is_none")]
    pub rpc_addr: Option<String>,
}

impl RunQueryParam {
    /// Wrap a job for dispatch
    #[must_use]
    pub fn new(job: Job) -> Self {
        Self { job, rpc_addr: None }
    }

    /// Record the issuer's RPC address
    #[must_use]
    pub fn with_rpc_addr(mut self, addr: impl Into<String>) -> Self {
        self.rpc_addr = Some(addr.into());
        self
    }

    /// Encode as a query payload
    ///
    /// # Errors
    ///
    /// Returns error if the job cannot be serialized
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a query payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid JSON or lacks a `Job` object
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let param: Self = serde_json::from_slice(payload)?;
        if param.job.name.is_empty() {
            return Err(CoreError::validation("Job.Name", "job name is empty"));
        }
        Ok(param)
    }
}
