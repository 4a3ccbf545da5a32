//! Gossip event loop.
//!
//! Consumes the membership event channel and dispatches queries by kind.
//! Run and stop requests are acknowledged immediately and invoked on a
//! tracked task, so a slow remote call never stalls the loop.

use crate::agent::AgentError;
use crate::gossip::Event;
use crate::membership::Membership;
use crate::query::{Query, QueryKind, QueryRequest, ResponseSink};
use crate::router::{JobRouter, RouterError};
use crate::scheduler::Scheduler;
use crate::store::Store;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use udup_core::{Job, RunQueryParam};

/// Dependencies only server nodes have
#[derive(Clone)]
pub struct ServerRole {
    /// Job store
    pub store: Arc<dyn Store>,
    /// Local scheduler
    pub scheduler: Arc<dyn Scheduler>,
    /// Port the RPC listener is bound to
    pub rpc_port: u16,
}

/// Why the loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The agent shut down
    Shutdown,
    /// Gossip stopped on its own
    GossipStopped,
    /// The event channel closed
    ChannelClosed,
    /// A fatal error was reported
    Fatal,
}

/// Event loop of one agent
pub struct EventLoop {
    membership: Membership,
    router: Arc<JobRouter>,
    tasks: TaskTracker,
    fatal: mpsc::Sender<AgentError>,
    server: Option<ServerRole>,
}

impl EventLoop {
    /// Create a loop for a client node
    #[must_use]
    pub fn new(
        membership: Membership,
        router: Arc<JobRouter>,
        tasks: TaskTracker,
        fatal: mpsc::Sender<AgentError>,
    ) -> Self {
        Self {
            membership,
            router,
            tasks,
            fatal,
            server: None,
        }
    }

    /// Handle server-only queries too
    #[must_use]
    pub fn with_server(mut self, role: ServerRole) -> Self {
        self.server = Some(role);
        self
    }

    /// Process events until shutdown, gossip stop or a fatal error
    pub async fn run(self, mut events: mpsc::Receiver<Event>, shutdown: CancellationToken) -> LoopExit {
        info!(node = %self.membership.node_name(), "Listening for events");
        let gossip_stopped = self.membership.shutdown_token();

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                _ = gossip_stopped.cancelled() => {
                    warn!("Gossip stopped, leaving event loop");
                    return LoopExit::GossipStopped;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                debug!("Event channel closed");
                return LoopExit::ChannelClosed;
            };

            if let ControlFlow::Break(exit) = self.dispatch(event, &shutdown).await {
                return exit;
            }
        }
    }

    /// Handle a single event
    pub async fn dispatch(&self, event: Event, shutdown: &CancellationToken) -> ControlFlow<LoopExit> {
        match event {
            Event::Member(event) => {
                for member in &event.members {
                    debug!(node = %self.membership.node_name(), member = %member.name, event = %event.kind, "Member event");
                }
                ControlFlow::Continue(())
            }
            Event::Query(query) => self.handle_query(query, shutdown).await,
        }
    }

    async fn handle_query(&self, query: Query, shutdown: &CancellationToken) -> ControlFlow<LoopExit> {
        debug!(query = query.name(), ltime = query.ltime().as_u64(), "Query received");
        let (request, sink) = query.into_parts();

        match (&request.kind, &self.server) {
            (QueryKind::SchedulerRestart, Some(role)) => {
                info!("Restarting scheduler");
                match role.store.get_jobs().await {
                    Ok(jobs) => role.scheduler.restart(jobs).await,
                    Err(e) => {
                        error!(error = %e, "Failed to load jobs for scheduler restart");
                        if let Err(dropped) = self.fatal.send(AgentError::SchedulerState(e)).await {
                            error!(error = %dropped.0, "Fatal error has no listener");
                        }
                        return ControlFlow::Break(LoopExit::Fatal);
                    }
                }
            }
            (QueryKind::RunJob, _) => {
                if let Some(job) = self.acknowledge(&request, sink) {
                    info!(job = %job.name, "Starting job");
                    let router = Arc::clone(&self.router);
                    self.spawn_routed(job, shutdown, move |job| async move {
                        router.invoke_job(job).await
                    });
                }
            }
            (QueryKind::StopJob, _) => {
                if let Some(job) = self.acknowledge(&request, sink) {
                    info!(job = %job.name, "Stopping job");
                    let router = Arc::clone(&self.router);
                    self.spawn_routed(job, shutdown, move |job| async move {
                        router.stop_job(job).await
                    });
                }
            }
            (QueryKind::RpcConfig, Some(role)) => {
                let local = self.membership.local_member().await;
                let address = SocketAddr::new(local.addr.ip(), role.rpc_port).to_string();
                debug!(addr = %address, "Answering RPC address query");
                if let Err(e) = sink.respond(address.into_bytes()) {
                    warn!(error = %e, "Failed to respond to RPC address query");
                }
            }
            (QueryKind::Unrecognized(name), _) => {
                warn!(query = %name, "Ignoring unrecognized query");
            }
            (kind, None) => {
                debug!(query = %kind, "Server query ignored on client node");
            }
        }
        ControlFlow::Continue(())
    }

    /// Decode the job, bind it to this node and answer with it
    fn acknowledge(&self, request: &QueryRequest, sink: ResponseSink) -> Option<Job> {
        let param = match RunQueryParam::decode(&request.payload) {
            Ok(param) => param,
            Err(e) => {
                warn!(query = %request.kind, error = %e, "Dropping query with malformed payload");
                return None;
            }
        };

        let mut job = param.job;
        job.node_name = self.membership.node_name().to_string();

        match job.to_json() {
            Ok(body) => {
                if let Err(e) = sink.respond(body) {
                    warn!(job = %job.name, error = %e, "Failed to acknowledge job query");
                }
            }
            Err(e) => warn!(job = %job.name, error = %e, "Failed to encode job acknowledgement"),
        }
        Some(job)
    }

    fn spawn_routed<F, Fut>(&self, job: Job, shutdown: &CancellationToken, call: F)
    where
        F: FnOnce(Job) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RouterError>> + Send + 'static,
    {
        let shutdown = shutdown.clone();
        let name = job.name.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => debug!(job = %name, "Job call cancelled by shutdown"),
                result = call(job) => {
                    if let Err(e) = result {
                        error!(job = %name, error = %e, "Job call failed");
                    }
                }
            }
        });
    }
}
