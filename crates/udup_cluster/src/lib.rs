//! UDUP Cluster
//!
//! Coordination core of a udup agent: gossip membership, query dispatch,
//! leader election over a TTL lock, job routing over RPC and the agent
//! lifecycle that wires them together.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod agent;
pub mod config;
pub mod driver;
pub mod event_loop;
pub mod gossip;
pub mod leader;
pub mod membership;
pub mod mesh;
pub mod query;
pub mod remote;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod udp;

pub use addr::{InterfaceSource, ResolveError, StaticInterfaces, SystemInterfaces, resolve_bind_addr};
pub use agent::{Agent, AgentBuilder, AgentError, AgentState, ClusterView, ServerDeps, Surface};
pub use config::{AgentConfig, ElectionConfig};
pub use driver::{BuiltinDrivers, DriverCatalog, DriverError};
pub use event_loop::{EventLoop, LoopExit, ServerRole};
pub use gossip::{Event, Gossip, GossipError, Member, MemberStatus, QueryParams};
pub use leader::{Campaign, Candidate, ElectionError, ElectionState, LeaderElector, LockClient, RetryPolicy};
pub use membership::{Membership, MembershipError, Transport};
pub use mesh::LocalMesh;
pub use query::{Query, QueryKind, ResponseSink};
pub use remote::{JobHandler, RemoteClient, RpcConnector, RpcError, RpcServer, TcpConnector};
pub use router::{JobRouter, RouterError};
pub use scheduler::{LocalScheduler, Scheduler, SchedulerStatus};
pub use store::{MemoryStore, Store};
pub use udp::UdpGossip;
