//! In-process gossip mesh.
//!
//! Every node created from the same [`LocalMesh`] shares one hub, so
//! membership changes and queries are delivered immediately and in order.
//! Used by tests and single-process development clusters.

use crate::gossip::{
    Event, Gossip, GossipConfig, GossipError, Member, MemberEvent, MemberEventKind,
    MemberStatus, NodeResponse, QueryParams,
};
use crate::query::{Query, ResponseSink};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use udup_core::{LamportClock, LogicalTime};

struct MeshNode {
    config: GossipConfig,
    member: Member,
    joined: bool,
    min_ltime: LogicalTime,
    token: CancellationToken,
}

/// Shared in-process hub
#[derive(Default)]
pub struct LocalMesh {
    nodes: RwLock<BTreeMap<String, MeshNode>>,
    clock: LamportClock,
}

impl LocalMesh {
    /// Create an empty mesh
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node
    ///
    /// # Errors
    ///
    /// Returns `NameConflict` if an alive node already uses the name
    pub async fn create(self: &Arc<Self>, config: GossipConfig) -> Result<MeshGossip, GossipError> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&config.node_name) {
            if existing.member.is_alive() {
                return Err(GossipError::NameConflict(config.node_name));
            }
        }

        let name = config.node_name.clone();
        let member = Member::new(name.clone(), config.bind_addr).with_tags(config.tags.clone());
        let token = CancellationToken::new();
        nodes.insert(
            name.clone(),
            MeshNode {
                config,
                member,
                joined: false,
                min_ltime: LogicalTime::zero(),
                token: token.clone(),
            },
        );
        debug!(target: "udup_cluster::gossip", node = %name, "Mesh node registered");

        Ok(MeshGossip {
            mesh: Arc::clone(self),
            name,
            token,
        })
    }

    /// Mark a node as failed, as if it stopped answering probes
    pub async fn fail(&self, name: &str) {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(name) else {
            return;
        };
        node.member.status = MemberStatus::Failed;
        node.token.cancel();
        let failed = node.member.clone();
        Self::broadcast(&nodes, name, MemberEventKind::Failed, vec![failed]);
    }

    /// Number of registered nodes, whatever their status
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Whether no node is registered
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    fn broadcast(
        nodes: &BTreeMap<String, MeshNode>,
        except: &str,
        kind: MemberEventKind,
        members: Vec<Member>,
    ) {
        for (name, node) in nodes {
            if name == except || !node.joined || !node.member.is_alive() {
                continue;
            }
            Self::notify(node, kind, members.clone());
        }
    }

    fn notify(node: &MeshNode, kind: MemberEventKind, members: Vec<Member>) {
        let event = Event::Member(MemberEvent { kind, members });
        if node.config.event_tx.try_send(event).is_err() {
            debug!(
                target: "udup_cluster::gossip",
                node = %node.member.name,
                "Event channel full or closed, dropping member event"
            );
        }
    }
}

/// Handle to one node of a [`LocalMesh`]
pub struct MeshGossip {
    mesh: Arc<LocalMesh>,
    name: String,
    token: CancellationToken,
}

#[async_trait]
impl Gossip for MeshGossip {
    async fn join(&self, addrs: &[String], ignore_old: bool) -> Result<usize, GossipError> {
        if self.token.is_cancelled() {
            return Err(GossipError::ShutDown);
        }
        let mut nodes = self.mesh.nodes.write().await;

        let mut contacted = 0;
        for addr in addrs {
            let target = nodes
                .iter()
                .find(|(name, node)| {
                    **name != self.name
                        && node.member.is_alive()
                        && node.member.addr.to_string() == *addr
                })
                .map(|(name, _)| name.clone());
            let Some(target) = target else {
                continue;
            };
            contacted += 1;
            if let Some(node) = nodes.get_mut(&target) {
                node.joined = true;
            }
        }

        if contacted == 0 {
            return Err(GossipError::JoinFailed {
                attempted: addrs.len(),
            });
        }

        let was_joined = match nodes.get_mut(&self.name) {
            Some(local) => {
                if ignore_old {
                    local.min_ltime = self.mesh.clock.time();
                }
                std::mem::replace(&mut local.joined, true)
            }
            None => return Err(GossipError::ShutDown),
        };

        if !was_joined {
            let local = nodes[&self.name].member.clone();
            LocalMesh::broadcast(&nodes, &self.name, MemberEventKind::Join, vec![local]);

            let peers: Vec<Member> = nodes
                .values()
                .filter(|n| n.joined && n.member.name != self.name)
                .map(|n| n.member.clone())
                .collect();
            LocalMesh::notify(&nodes[&self.name], MemberEventKind::Join, peers);
        }

        Ok(contacted)
    }

    async fn members(&self) -> Vec<Member> {
        let nodes = self.mesh.nodes.read().await;
        let joined = nodes.get(&self.name).is_some_and(|n| n.joined);
        nodes
            .values()
            .filter(|n| n.member.name == self.name || (joined && n.joined))
            .map(|n| n.member.clone())
            .collect()
    }

    async fn local_member(&self) -> Member {
        let nodes = self.mesh.nodes.read().await;
        nodes
            .get(&self.name)
            .map(|n| n.member.clone())
            .unwrap_or_else(|| Member::new(self.name.clone(), ([0, 0, 0, 0], 0).into()))
    }

    async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParams,
    ) -> Result<mpsc::Receiver<NodeResponse>, GossipError> {
        if self.token.is_cancelled() {
            return Err(GossipError::ShutDown);
        }

        let ltime = self.mesh.clock.increment();
        let targets: Vec<(String, GossipConfig)> = {
            let nodes = self.mesh.nodes.read().await;
            let Some(local) = nodes.get(&self.name) else {
                return Err(GossipError::ShutDown);
            };
            let limit = local.config.query_size_limit;
            if payload.len() > limit {
                return Err(GossipError::QueryTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
            nodes
                .values()
                .filter(|n| n.member.name == self.name || (local.joined && n.joined))
                .filter(|n| n.member.is_alive() && params.targets(&n.member.name))
                .filter(|n| ltime >= n.min_ltime)
                .map(|n| (n.member.name.clone(), n.config.clone()))
                .collect()
        };

        let (resp_tx, resp_rx) = mpsc::channel(targets.len().max(1));
        for (target, config) in targets {
            let (sink, rx) = ResponseSink::channel(config.query_response_size_limit);
            let query = Query::new(name, payload.clone(), ltime, sink);
            if config.event_tx.send(Event::Query(query)).await.is_err() {
                continue;
            }

            let resp_tx = resp_tx.clone();
            let timeout = params.timeout;
            tokio::spawn(async move {
                if let Ok(Ok(payload)) = tokio::time::timeout(timeout, rx).await {
                    let _ = resp_tx.send(NodeResponse { from: target, payload }).await;
                }
            });
        }

        Ok(resp_rx)
    }

    async fn leave(&self) -> Result<(), GossipError> {
        let mut nodes = self.mesh.nodes.write().await;
        let Some(local) = nodes.get_mut(&self.name) else {
            return Ok(());
        };
        if local.member.status == MemberStatus::Left {
            return Ok(());
        }
        local.member.status = MemberStatus::Left;
        local.token.cancel();
        let left = local.member.clone();
        LocalMesh::broadcast(&nodes, &self.name, MemberEventKind::Leave, vec![left]);
        Ok(())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
