//! Agent lifecycle.
//!
//! [`AgentBuilder`] is the composition root: every collaborator the agent
//! talks to (gossip transport, interfaces, drivers, RPC connector, store,
//! scheduler, campaign, HTTP surface) is injected there. [`Agent::start`]
//! brings the node up in order and [`Agent::shutdown`] tears it down once.

use crate::addr::{InterfaceSource, ResolveError, SystemInterfaces, resolve_bind_addr};
use crate::config::AgentConfig;
use crate::driver::{BuiltinDrivers, DriverCatalog, DriverError, discover_all};
use crate::event_loop::{EventLoop, ServerRole};
use crate::gossip::{Event, Member};
use crate::leader::{Campaign, Candidate, ElectionState, LeaderElector, RetryPolicy};
use crate::membership::{Membership, MembershipError, Transport};
use crate::remote::{JobHandler, RpcConnector, RpcError, RpcServer, TcpConnector};
use crate::router::JobRouter;
use crate::scheduler::Scheduler;
use crate::store::Store;
use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use udup_core::CoreError;

/// Default time granted to in-flight tasks on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    Config(#[source] CoreError),

    /// Bind address could not be resolved
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Membership failed to start
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// A required driver could not be loaded
    #[error("Driver discovery failed: {0}")]
    Drivers(#[from] DriverError),

    /// RPC listener failed
    #[error("RPC listener failed: {0}")]
    Rpc(#[from] RpcError),

    /// HTTP surface failed to start
    #[error("HTTP surface failed: {0}")]
    Surface(#[source] std::io::Error),

    /// The job set could not be read for the scheduler
    #[error("Error on getting jobs: {0}")]
    SchedulerState(#[source] CoreError),

    /// Server mode without store and scheduler
    #[error("Server mode requires a store and a scheduler")]
    MissingServerDeps,

    /// `start` called twice
    #[error("Agent already started")]
    AlreadyStarted,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Built, not started
    NotStarted,
    /// Started
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// Shut down
    ShutDown,
}

/// Read-only view of a running agent for outer surfaces
#[derive(Clone)]
pub struct ClusterView {
    membership: Membership,
    store: Option<Arc<dyn Store>>,
    elector: Option<Arc<LeaderElector>>,
    state: watch::Receiver<AgentState>,
}

impl ClusterView {
    /// View over the given collaborators
    #[must_use]
    pub fn new(
        membership: Membership,
        store: Option<Arc<dyn Store>>,
        elector: Option<Arc<LeaderElector>>,
        state: watch::Receiver<AgentState>,
    ) -> Self {
        Self {
            membership,
            store,
            elector,
            state,
        }
    }

    /// Local node name
    #[must_use]
    pub fn node_name(&self) -> &str {
        self.membership.node_name()
    }

    /// Every known member
    pub async fn members(&self) -> Vec<Member> {
        self.membership.members().await
    }

    /// Current leader; `None` on nodes without a store
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or the leader is not a known member
    pub async fn leader(&self) -> Result<Option<Member>, MembershipError> {
        match &self.store {
            Some(store) => self.membership.leader_member(store.as_ref()).await.map(Some),
            None => Ok(None),
        }
    }

    /// Election state of this node; `None` on client nodes
    pub async fn election_state(&self) -> Option<ElectionState> {
        match &self.elector {
            Some(elector) => Some(elector.state().await),
            None => None,
        }
    }

    /// Agent lifecycle state
    #[must_use]
    pub fn agent_state(&self) -> AgentState {
        *self.state.borrow()
    }
}

/// Outer surface started with a server agent, such as the HTTP API
#[async_trait]
pub trait Surface: Send + Sync {
    /// Start serving `view` on `tasks` until `shutdown`; returns the bound address
    async fn start(
        &self,
        view: ClusterView,
        shutdown: CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<SocketAddr, std::io::Error>;
}

/// Collaborators of a server node
#[derive(Clone)]
pub struct ServerDeps {
    /// Job store, also the leadership lock service
    pub store: Arc<dyn Store>,
    /// Scheduler driven by leadership
    pub scheduler: Arc<dyn Scheduler>,
    /// Executes jobs received over RPC
    pub job_handler: Arc<dyn JobHandler>,
    /// Campaign override; a [`Candidate`] over the store otherwise
    pub campaign: Option<Arc<dyn Campaign>>,
}

impl ServerDeps {
    /// Create server dependencies
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<dyn Scheduler>,
        job_handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            store,
            scheduler,
            job_handler,
            campaign: None,
        }
    }

    /// Use a custom campaign
    #[must_use]
    pub fn with_campaign(mut self, campaign: Arc<dyn Campaign>) -> Self {
        self.campaign = Some(campaign);
        self
    }
}

/// Builder of an [`Agent`]
pub struct AgentBuilder {
    config: AgentConfig,
    transport: Transport,
    interfaces: Arc<dyn InterfaceSource>,
    drivers: Arc<dyn DriverCatalog>,
    connector: Arc<dyn RpcConnector>,
    server: Option<ServerDeps>,
    surface: Option<Arc<dyn Surface>>,
    shutdown_grace: Duration,
}

impl AgentBuilder {
    /// Start from `config` with UDP gossip and the host's interfaces
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            transport: Transport::Udp,
            interfaces: Arc::new(SystemInterfaces),
            drivers: Arc::new(BuiltinDrivers::new()),
            connector: Arc::new(TcpConnector::new()),
            server: None,
            surface: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Set the gossip transport
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the interface source
    #[must_use]
    pub fn with_interfaces(mut self, interfaces: Arc<dyn InterfaceSource>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Set the driver catalog
    #[must_use]
    pub fn with_drivers(mut self, drivers: Arc<dyn DriverCatalog>) -> Self {
        self.drivers = drivers;
        self
    }

    /// Set the RPC connector
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn RpcConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Provide the server collaborators
    #[must_use]
    pub fn with_server(mut self, deps: ServerDeps) -> Self {
        self.server = Some(deps);
        self
    }

    /// Start `surface` alongside a server agent
    #[must_use]
    pub fn with_surface(mut self, surface: Arc<dyn Surface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Time granted to in-flight tasks on shutdown
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the agent
    #[must_use]
    pub fn build(self) -> Agent {
        let (state_tx, _) = watch::channel(AgentState::NotStarted);
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        Agent {
            config: self.config,
            transport: self.transport,
            interfaces: self.interfaces,
            drivers: self.drivers,
            connector: self.connector,
            server: self.server,
            surface: self.surface,
            shutdown_grace: self.shutdown_grace,
            lifecycle: Mutex::new(Lifecycle::default()),
            state: state_tx,
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    membership: Option<Membership>,
    elector: Option<Arc<LeaderElector>>,
    bind_addr: Option<SocketAddr>,
    rpc_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
}

/// A udup agent
pub struct Agent {
    config: AgentConfig,
    transport: Transport,
    interfaces: Arc<dyn InterfaceSource>,
    drivers: Arc<dyn DriverCatalog>,
    connector: Arc<dyn RpcConnector>,
    server: Option<ServerDeps>,
    surface: Option<Arc<dyn Surface>>,
    shutdown_grace: Duration,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<AgentState>,
    fatal_tx: mpsc::Sender<AgentError>,
    fatal_rx: Mutex<mpsc::Receiver<AgentError>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Agent {
    /// Builder for `config`
    #[must_use]
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// Bring the agent up.
    ///
    /// Joining the configured peers is best effort; every other step aborts
    /// the start on failure. A start that fails once membership is up tears
    /// down whatever it spawned, leaves the cluster and moves the agent to
    /// [`AgentState::ShutDown`].
    ///
    /// # Errors
    ///
    /// Returns the first failing step
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != AgentState::NotStarted {
            return Err(AgentError::AlreadyStarted);
        }

        let mut config = self.config.clone();
        config.validate().map_err(AgentError::Config)?;
        if config.server && self.server.is_none() {
            return Err(AgentError::MissingServerDeps);
        }

        let bind = resolve_bind_addr(&mut config, self.interfaces.as_ref())?;
        let (membership, events) = Membership::setup(&config, bind, self.transport.clone()).await?;

        if !config.start_join.is_empty() {
            // failures are logged by membership
            let _ = membership.join(&config.start_join, true).await;
        }

        if let Err(e) = self.start_services(&config, &membership, events, &mut lifecycle).await {
            error!(error = %e, node = %config.node_name, "Agent failed to start");
            self.teardown(Some(&membership)).await;
            lifecycle.elector = None;
            lifecycle.rpc_addr = None;
            lifecycle.http_addr = None;
            self.state.send_replace(AgentState::ShutDown);
            return Err(e);
        }

        lifecycle.bind_addr = Some(bind);
        lifecycle.membership = Some(membership);
        self.state.send_replace(AgentState::Running);
        info!(node = %config.node_name, bind = %bind, server = config.server, "Agent running");
        Ok(())
    }

    async fn start_services(
        &self,
        config: &AgentConfig,
        membership: &Membership,
        events: mpsc::Receiver<Event>,
        lifecycle: &mut Lifecycle,
    ) -> Result<(), AgentError> {
        if let Err(e) = discover_all(self.drivers.as_ref()) {
            error!(error = %e, "Failed to discover drivers");
            return Err(e.into());
        }

        let router = Arc::new(JobRouter::new(membership.clone(), Arc::clone(&self.connector)));
        let mut event_loop = EventLoop::new(
            membership.clone(),
            router,
            self.tasks.clone(),
            self.fatal_tx.clone(),
        );

        if let (true, Some(deps)) = (config.server, &self.server) {
            let local_ip = membership.local_member().await.addr.ip();
            let rpc = RpcServer::bind(
                SocketAddr::new(local_ip, config.rpc_port),
                Arc::clone(&deps.job_handler),
            )
            .await?;
            let rpc_addr = rpc.local_addr()?;
            self.tasks.spawn(rpc.serve(self.shutdown.clone()));
            lifecycle.rpc_addr = Some(rpc_addr);

            let campaign = deps.campaign.clone().unwrap_or_else(|| {
                Arc::new(Candidate::new(
                    deps.store.lock_client(),
                    deps.store.leader_key(),
                    config.node_name.clone(),
                    config.election.leader_ttl(),
                ))
            });
            let elector = Arc::new(
                LeaderElector::new(
                    config.node_name.clone(),
                    campaign,
                    Arc::clone(&deps.store),
                    Arc::clone(&deps.scheduler),
                    self.fatal_tx.clone(),
                )
                .with_retry(RetryPolicy::from_config(&config.election)),
            );
            elector.participate(&self.tasks, self.shutdown.clone());
            lifecycle.elector = Some(Arc::clone(&elector));

            if let Some(surface) = &self.surface {
                let view = ClusterView::new(
                    membership.clone(),
                    Some(Arc::clone(&deps.store)),
                    Some(elector),
                    self.state.subscribe(),
                );
                let http_addr = surface
                    .start(view, self.shutdown.clone(), &self.tasks)
                    .await
                    .map_err(AgentError::Surface)?;
                lifecycle.http_addr = Some(http_addr);
            }

            event_loop = event_loop.with_server(ServerRole {
                store: Arc::clone(&deps.store),
                scheduler: Arc::clone(&deps.scheduler),
                rpc_port: rpc_addr.port(),
            });
        }

        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let exit = event_loop.run(events, shutdown).await;
            info!(reason = ?exit, "Event loop stopped");
        });
        Ok(())
    }

    /// Cancel every background task, leave the cluster and wait out the grace
    async fn teardown(&self, membership: Option<&Membership>) {
        self.shutdown.cancel();

        if let Some(membership) = membership {
            if let Err(e) = membership.leave().await {
                warn!(error = %e, "Error leaving cluster");
            }
        }

        self.tasks.close();
        if tokio::time::timeout(self.shutdown_grace, self.tasks.wait()).await.is_err() {
            warn!(grace = ?self.shutdown_grace, "Tasks still running after shutdown grace");
        }
    }

    /// Stop the agent. Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// Currently infallible; leave failures are logged
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let lifecycle = self.lifecycle.lock().await;
        match self.state() {
            AgentState::ShutDown => return Ok(()),
            AgentState::NotStarted => {
                self.shutdown.cancel();
                self.tasks.close();
                self.state.send_replace(AgentState::ShutDown);
                return Ok(());
            }
            AgentState::Running | AgentState::ShuttingDown => {}
        }

        info!(node = %self.config.node_name, "Requesting graceful leave from cluster");
        self.state.send_replace(AgentState::ShuttingDown);
        self.teardown(lifecycle.membership.as_ref()).await;

        self.state.send_replace(AgentState::ShutDown);
        info!("Agent shut down");
        Ok(())
    }

    /// Wait for the next fatal error reported by a background task
    pub async fn fatal(&self) -> Option<AgentError> {
        self.fatal_rx.lock().await.recv().await
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Configuration the agent was built with
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Membership handle once started
    pub async fn membership(&self) -> Option<Membership> {
        self.lifecycle.lock().await.membership.clone()
    }

    /// Leader elector of a started server
    pub async fn elector(&self) -> Option<Arc<LeaderElector>> {
        self.lifecycle.lock().await.elector.clone()
    }

    /// Resolved gossip bind address
    pub async fn bind_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.bind_addr
    }

    /// Bound RPC listener address of a started server
    pub async fn rpc_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.rpc_addr
    }

    /// Bound HTTP surface address
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.http_addr
    }
}
