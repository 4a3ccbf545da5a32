//! UDP gossip back-end.
//!
//! Members exchange JSON datagrams over a single socket. Liveness is checked
//! with ping/ack; a member that stays silent for `suspect_timeout` is declared
//! failed and retried every `reconnect_interval` until it is reaped. Member
//! lists piggyback on acks, so membership converges without a coordinator.
//!
//! Queries are sent directly to every target and answered over the same
//! socket. Each query carries the issuer's Lamport time; a node that joined
//! with `ignore_old` drops queries issued before it joined.

use crate::addr::default_advertise_ip;
use crate::gossip::{
    Event, Gossip, GossipConfig, GossipError, Member, MemberEvent, MemberEventKind,
    MemberStatus, NodeResponse, QueryParams,
};
use crate::query::{Query, ResponseSink};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use udup_core::{LamportClock, LogicalTime};

const MAX_DATAGRAM: usize = 64 * 1024;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SEEN_QUERY_CAPACITY: usize = 1024;

/// Member as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WireMember {
    name: String,
    addr: SocketAddr,
    tags: BTreeMap<String, String>,
    status: MemberStatus,
    incarnation: u64,
}

impl WireMember {
    fn to_member(&self) -> Member {
        Member::new(self.name.clone(), self.addr)
            .with_tags(self.tags.clone())
            .with_status(self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message {
    Join {
        member: WireMember,
    },
    PushPull {
        from: String,
        members: Vec<WireMember>,
        query_clock: LogicalTime,
    },
    Conflict {
        name: String,
    },
    Ping {
        from: String,
        seq: u64,
    },
    Ack {
        from: String,
        seq: u64,
        members: Vec<WireMember>,
    },
    Leave {
        name: String,
        incarnation: u64,
    },
    Query {
        id: u64,
        origin: String,
        origin_addr: SocketAddr,
        ltime: LogicalTime,
        name: String,
        payload: Vec<u8>,
        filter: Vec<String>,
        timeout_ms: u64,
    },
    QueryResponse {
        id: u64,
        from: String,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy)]
enum JoinReply {
    Accepted(LogicalTime),
    Conflict,
}

/// Membership snapshot persisted across restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Snapshot {
    clock: LogicalTime,
    left: bool,
    peers: Vec<SnapshotPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotPeer {
    name: String,
    addr: SocketAddr,
}

struct Peer {
    member: Member,
    incarnation: u64,
    last_seen: Instant,
    changed_at: Instant,
}

struct PendingQuery {
    tx: mpsc::Sender<NodeResponse>,
    expected: usize,
    received: usize,
}

#[derive(Default)]
struct SeenQueries {
    order: VecDeque<(String, u64)>,
    set: HashSet<(String, u64)>,
}

impl SeenQueries {
    /// Record a query; false if it was already seen
    fn insert(&mut self, origin: &str, id: u64) -> bool {
        let key = (origin.to_string(), id);
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_QUERY_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

struct Shared {
    config: GossipConfig,
    socket: UdpSocket,
    local: RwLock<Member>,
    incarnation: u64,
    peers: RwLock<HashMap<String, Peer>>,
    clock: LamportClock,
    min_query_ltime: AtomicU64,
    pending_joins: Mutex<HashMap<SocketAddr, oneshot::Sender<JoinReply>>>,
    pending_queries: Mutex<HashMap<u64, PendingQuery>>,
    seen_queries: Mutex<SeenQueries>,
    next_query_id: AtomicU64,
    probe_seq: AtomicU64,
    dirty: AtomicBool,
    member_tx: mpsc::UnboundedSender<MemberEvent>,
    token: CancellationToken,
}

/// Gossip over UDP
#[derive(Clone)]
pub struct UdpGossip {
    shared: Arc<Shared>,
}

impl UdpGossip {
    /// Bind the socket, start the background loops and rejoin snapshot peers
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound or the snapshot is unreadable
    pub async fn create(config: GossipConfig) -> Result<Self, GossipError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let bound = socket.local_addr()?;
        let advertise = if bound.ip().is_unspecified() {
            let ip = default_advertise_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            SocketAddr::new(ip, bound.port())
        } else {
            bound
        };

        let snapshot = match &config.snapshot_path {
            Some(path) => read_snapshot(path).await?,
            None => Snapshot::default(),
        };

        let clock = LamportClock::new();
        if snapshot.clock > LogicalTime::zero() {
            clock.witness(snapshot.clock);
        }

        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);

        let local = Member::new(config.node_name.clone(), advertise).with_tags(config.tags.clone());
        let (member_tx, member_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let shared = Arc::new(Shared {
            socket,
            local: RwLock::new(local),
            incarnation,
            peers: RwLock::new(HashMap::new()),
            clock,
            min_query_ltime: AtomicU64::new(0),
            pending_joins: Mutex::new(HashMap::new()),
            pending_queries: Mutex::new(HashMap::new()),
            seen_queries: Mutex::new(SeenQueries::default()),
            next_query_id: AtomicU64::new(1),
            probe_seq: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            member_tx,
            token: token.clone(),
            config,
        });

        tokio::spawn(coalesce_loop(
            member_rx,
            shared.config.event_tx.clone(),
            shared.config.coalesce_period,
            shared.config.quiescent_period,
            token.clone(),
        ));
        tokio::spawn(Arc::clone(&shared).receive_loop());
        tokio::spawn(Arc::clone(&shared).probe_loop());
        tokio::spawn(Arc::clone(&shared).maintenance_loop());

        debug!(
            target: "udup_cluster::gossip",
            node = %shared.config.node_name,
            addr = %advertise,
            "Gossip listening"
        );

        if !snapshot.peers.is_empty() {
            if snapshot.left && !shared.config.rejoin_after_leave {
                debug!(
                    target: "udup_cluster::gossip",
                    "Left cluster previously, not rejoining snapshot peers"
                );
            } else {
                let addrs: Vec<String> =
                    snapshot.peers.iter().map(|p| p.addr.to_string()).collect();
                let rejoin = Arc::clone(&shared);
                tokio::spawn(async move {
                    match rejoin.join(&addrs, false).await {
                        Ok(n) => debug!(target: "udup_cluster::gossip", peers = n, "Rejoined snapshot peers"),
                        Err(e) => debug!(target: "udup_cluster::gossip", error = %e, "Failed to rejoin snapshot peers"),
                    }
                });
            }
        }

        Ok(Self { shared })
    }

    /// Advertised gossip address
    pub async fn local_addr(&self) -> SocketAddr {
        self.shared.local.read().await.addr
    }
}

#[async_trait]
impl Gossip for UdpGossip {
    async fn join(&self, addrs: &[String], ignore_old: bool) -> Result<usize, GossipError> {
        self.shared.join(addrs, ignore_old).await
    }

    async fn members(&self) -> Vec<Member> {
        let mut members = vec![self.shared.local.read().await.clone()];
        let peers = self.shared.peers.read().await;
        members.extend(peers.values().map(|p| p.member.clone()));
        members
    }

    async fn local_member(&self) -> Member {
        self.shared.local.read().await.clone()
    }

    async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParams,
    ) -> Result<mpsc::Receiver<NodeResponse>, GossipError> {
        self.shared.query(name, payload, params).await
    }

    async fn leave(&self) -> Result<(), GossipError> {
        self.shared.leave().await
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shared.token.clone()
    }
}

impl Shared {
    async fn local_wire(&self) -> WireMember {
        let local = self.local.read().await;
        WireMember {
            name: local.name.clone(),
            addr: local.addr,
            tags: local.tags.clone(),
            status: local.status,
            incarnation: self.incarnation,
        }
    }

    async fn member_list(&self) -> Vec<WireMember> {
        let mut list = vec![self.local_wire().await];
        let peers = self.peers.read().await;
        list.extend(peers.values().map(|p| WireMember {
            name: p.member.name.clone(),
            addr: p.member.addr,
            tags: p.member.tags.clone(),
            status: p.member.status,
            incarnation: p.incarnation,
        }));
        list
    }

    async fn send(&self, to: SocketAddr, message: &Message) {
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(target: "udup_cluster::gossip", error = %e, "Failed to encode gossip message");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            debug!(target: "udup_cluster::gossip", to = %to, error = %e, "Failed to send gossip message");
        }
    }

    fn emit(&self, kind: MemberEventKind, member: Member) {
        self.dirty.store(true, Ordering::Relaxed);
        let _ = self.member_tx.send(MemberEvent {
            kind,
            members: vec![member],
        });
    }

    async fn join(&self, addrs: &[String], ignore_old: bool) -> Result<usize, GossipError> {
        if self.token.is_cancelled() {
            return Err(GossipError::ShutDown);
        }
        if addrs.is_empty() {
            return Ok(0);
        }

        let message = Message::Join {
            member: self.local_wire().await,
        };

        let mut waits = Vec::new();
        for addr in addrs {
            let target = match tokio::net::lookup_host(addr.as_str()).await {
                Ok(mut resolved) => resolved.next(),
                Err(e) => {
                    debug!(target: "udup_cluster::gossip", addr = %addr, error = %e, "Failed to resolve join address");
                    None
                }
            };
            let Some(target) = target else {
                continue;
            };

            let (tx, rx) = oneshot::channel();
            self.pending_joins.lock().await.insert(target, tx);
            self.send(target, &message).await;
            waits.push(async move { (target, tokio::time::timeout(JOIN_TIMEOUT, rx).await) });
        }

        let mut joined = 0;
        let mut conflict = false;
        let mut newest = LogicalTime::zero();
        for (target, result) in futures::future::join_all(waits).await {
            match result {
                Ok(Ok(JoinReply::Accepted(clock))) => {
                    joined += 1;
                    newest = newest.max(clock);
                }
                Ok(Ok(JoinReply::Conflict)) => conflict = true,
                _ => {
                    self.pending_joins.lock().await.remove(&target);
                    debug!(target: "udup_cluster::gossip", addr = %target, "No answer to join");
                }
            }
        }

        if joined == 0 {
            if conflict {
                return Err(GossipError::NameConflict(self.config.node_name.clone()));
            }
            return Err(GossipError::JoinFailed {
                attempted: addrs.len(),
            });
        }

        if ignore_old {
            self.min_query_ltime
                .fetch_max(newest.incremented().as_u64(), Ordering::SeqCst);
        }
        self.dirty.store(true, Ordering::Relaxed);
        Ok(joined)
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
        let limit = self.config.query_size_limit;
        if payload.len() > limit {
            return Err(GossipError::QueryTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let ltime = self.clock.increment();
        let id = self.next_query_id.fetch_add(1, Ordering::SeqCst);
        let local = self.local.read().await.clone();

        let mut targets = Vec::new();
        if params.targets(&local.name) {
            targets.push(local.addr);
        }
        {
            let peers = self.peers.read().await;
            targets.extend(
                peers
                    .values()
                    .filter(|p| p.member.is_alive() && params.targets(&p.member.name))
                    .map(|p| p.member.addr),
            );
        }

        let (tx, rx) = mpsc::channel(targets.len().max(1));
        if targets.is_empty() {
            return Ok(rx);
        }
        self.pending_queries.lock().await.insert(
            id,
            PendingQuery {
                tx,
                expected: targets.len(),
                received: 0,
            },
        );

        let message = Message::Query {
            id,
            origin: local.name,
            origin_addr: local.addr,
            ltime,
            name: name.to_string(),
            payload,
            filter: params.filter_nodes.clone(),
            timeout_ms: params.timeout.as_millis() as u64,
        };
        for target in targets {
            self.send(target, &message).await;
        }

        debug!(target: "udup_cluster::gossip", query = name, %ltime, "Query issued");
        Ok(rx)
    }

    async fn leave(&self) -> Result<(), GossipError> {
        {
            let mut local = self.local.write().await;
            if local.status == MemberStatus::Left {
                return Ok(());
            }
            local.status = MemberStatus::Left;
        }

        let message = Message::Leave {
            name: self.config.node_name.clone(),
            incarnation: self.incarnation,
        };
        let targets: Vec<SocketAddr> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| p.member.is_alive())
                .map(|p| p.member.addr)
                .collect()
        };
        for target in targets {
            self.send(target, &message).await;
        }

        let result = self.write_snapshot(true).await;
        self.token.cancel();
        debug!(target: "udup_cluster::gossip", node = %self.config.node_name, "Left cluster");
        result
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, src)) => match serde_json::from_slice::<Message>(&buf[..len]) {
                    Ok(message) => self.handle(message, src).await,
                    Err(e) => {
                        debug!(target: "udup_cluster::gossip", from = %src, error = %e, "Dropping malformed datagram");
                    }
                },
                Err(e) => {
                    debug!(target: "udup_cluster::gossip", error = %e, "Failed to receive datagram");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle(self: &Arc<Self>, message: Message, src: SocketAddr) {
        match message {
            Message::Join { member } => self.handle_join(member, src).await,
            Message::PushPull {
                from,
                members,
                query_clock,
            } => {
                self.clock.witness(query_clock);
                if let Some(tx) = self.pending_joins.lock().await.remove(&src) {
                    let _ = tx.send(JoinReply::Accepted(query_clock));
                }
                self.touch(&from).await;
                for member in members {
                    self.merge(member).await;
                }
            }
            Message::Conflict { name } => {
                debug!(target: "udup_cluster::gossip", node = %name, from = %src, "Node name already in use");
                if let Some(tx) = self.pending_joins.lock().await.remove(&src) {
                    let _ = tx.send(JoinReply::Conflict);
                }
            }
            Message::Ping { from, seq } => {
                self.touch(&from).await;
                let ack = Message::Ack {
                    from: self.config.node_name.clone(),
                    seq,
                    members: self.member_list().await,
                };
                self.send(src, &ack).await;
            }
            Message::Ack { from, members, .. } => {
                self.touch(&from).await;
                for member in members {
                    self.merge(member).await;
                }
            }
            Message::Leave { name, incarnation } => self.handle_leave(&name, incarnation).await,
            Message::Query {
                id,
                origin,
                origin_addr,
                ltime,
                name,
                payload,
                filter,
                timeout_ms,
            } => {
                if !self.seen_queries.lock().await.insert(&origin, id) {
                    return;
                }
                self.clock.witness(ltime);
                if ltime.as_u64() < self.min_query_ltime.load(Ordering::SeqCst) {
                    debug!(target: "udup_cluster::gossip", query = %name, %ltime, "Ignoring query issued before join");
                    return;
                }
                if !filter.is_empty() && !filter.contains(&self.config.node_name) {
                    return;
                }
                self.deliver_query(id, origin_addr, ltime, &name, payload, Duration::from_millis(timeout_ms))
                    .await;
            }
            Message::QueryResponse { id, from, payload } => {
                let mut pending = self.pending_queries.lock().await;
                let Some(query) = pending.get_mut(&id) else {
                    return;
                };
                let _ = query.tx.try_send(NodeResponse { from, payload });
                query.received += 1;
                if query.received >= query.expected {
                    pending.remove(&id);
                }
            }
        }
    }

    async fn handle_join(&self, member: WireMember, src: SocketAddr) {
        if member.name == self.config.node_name {
            if member.addr != self.local.read().await.addr {
                self.send(src, &Message::Conflict { name: member.name }).await;
            }
            return;
        }

        let now = Instant::now();
        let event = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&member.name) {
                Some(peer)
                    if peer.member.is_alive()
                        && peer.member.addr != member.addr
                        && self.config.enable_name_conflict_resolution =>
                {
                    None
                }
                Some(peer) => {
                    let was_alive = peer.member.is_alive();
                    peer.member = member.to_member().with_status(MemberStatus::Alive);
                    peer.incarnation = peer.incarnation.max(member.incarnation);
                    peer.last_seen = now;
                    if was_alive {
                        Some(None)
                    } else {
                        peer.changed_at = now;
                        Some(Some(peer.member.clone()))
                    }
                }
                None => {
                    let joined = member.to_member().with_status(MemberStatus::Alive);
                    peers.insert(
                        member.name.clone(),
                        Peer {
                            member: joined.clone(),
                            incarnation: member.incarnation,
                            last_seen: now,
                            changed_at: now,
                        },
                    );
                    Some(Some(joined))
                }
            }
        };

        match event {
            None => {
                debug!(
                    target: "udup_cluster::gossip",
                    node = %member.name,
                    addr = %member.addr,
                    "Rejecting join, name held by a live member"
                );
                self.send(src, &Message::Conflict { name: member.name }).await;
            }
            Some(joined) => {
                if let Some(joined) = joined {
                    debug!(target: "udup_cluster::gossip", node = %joined.name, addr = %joined.addr, "Member joined");
                    self.emit(MemberEventKind::Join, joined);
                }
                let reply = Message::PushPull {
                    from: self.config.node_name.clone(),
                    members: self.member_list().await,
                    query_clock: self.clock.time(),
                };
                self.send(src, &reply).await;
            }
        }
    }

    async fn handle_leave(&self, name: &str, incarnation: u64) {
        let left = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(name) {
                Some(peer) if peer.member.status != MemberStatus::Left && incarnation >= peer.incarnation => {
                    peer.member.status = MemberStatus::Left;
                    peer.changed_at = Instant::now();
                    Some(peer.member.clone())
                }
                _ => None,
            }
        };
        if let Some(left) = left {
            debug!(target: "udup_cluster::gossip", node = %left.name, "Member left");
            self.emit(MemberEventKind::Leave, left);
        }
    }

    /// Direct contact from `name`
    async fn touch(&self, name: &str) {
        let revived = {
            let mut peers = self.peers.write().await;
            let Some(peer) = peers.get_mut(name) else {
                return;
            };
            let now = Instant::now();
            peer.last_seen = now;
            if peer.member.status == MemberStatus::Failed {
                peer.member.status = MemberStatus::Alive;
                peer.changed_at = now;
                Some(peer.member.clone())
            } else {
                None
            }
        };
        if let Some(member) = revived {
            debug!(target: "udup_cluster::gossip", node = %member.name, "Failed member is reachable again");
            self.emit(MemberEventKind::Join, member);
        }
    }

    /// Merge second-hand member state
    async fn merge(&self, incoming: WireMember) {
        if incoming.name == self.config.node_name {
            return;
        }
        let now = Instant::now();
        let change = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&incoming.name) {
                None => {
                    if incoming.status != MemberStatus::Alive {
                        return;
                    }
                    let member = incoming.to_member();
                    peers.insert(
                        incoming.name.clone(),
                        Peer {
                            member: member.clone(),
                            incarnation: incoming.incarnation,
                            last_seen: now,
                            changed_at: now,
                        },
                    );
                    Some((MemberEventKind::Join, member))
                }
                Some(peer) => {
                    if incoming.incarnation < peer.incarnation {
                        return;
                    }
                    let newer = incoming.incarnation > peer.incarnation;
                    peer.incarnation = incoming.incarnation;
                    match incoming.status {
                        MemberStatus::Left if peer.member.status != MemberStatus::Left => {
                            peer.member.status = MemberStatus::Left;
                            peer.changed_at = now;
                            Some((MemberEventKind::Leave, peer.member.clone()))
                        }
                        MemberStatus::Alive if !peer.member.is_alive() && newer => {
                            peer.member = incoming.to_member();
                            peer.last_seen = now;
                            peer.changed_at = now;
                            Some((MemberEventKind::Join, peer.member.clone()))
                        }
                        MemberStatus::Alive
                            if peer.member.is_alive() && peer.member.tags != incoming.tags =>
                        {
                            peer.member.tags = incoming.tags;
                            Some((MemberEventKind::Update, peer.member.clone()))
                        }
                        _ => None,
                    }
                }
            }
        };
        if let Some((kind, member)) = change {
            debug!(target: "udup_cluster::gossip", node = %member.name, event = %kind, "Merged member state");
            self.emit(kind, member);
        }
    }

    async fn deliver_query(
        self: &Arc<Self>,
        id: u64,
        origin_addr: SocketAddr,
        ltime: LogicalTime,
        name: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) {
        let (sink, rx) = ResponseSink::channel(self.config.query_response_size_limit);
        let query = Query::new(name, payload, ltime, sink);
        if self.config.event_tx.send(Event::Query(query)).await.is_err() {
            return;
        }

        let from = self.config.node_name.clone();
        let shared = Arc::clone(self);
        let timeout = if timeout.is_zero() {
            self.config.query_timeout
        } else {
            timeout
        };
        tokio::spawn(async move {
            if let Ok(Ok(payload)) = tokio::time::timeout(timeout, rx).await {
                let response = Message::QueryResponse { id, from, payload };
                shared.send(origin_addr, &response).await;
            }
        });
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.detect_failures().await;

            let target = {
                let peers = self.peers.read().await;
                let alive: Vec<SocketAddr> = peers
                    .values()
                    .filter(|p| p.member.is_alive())
                    .map(|p| p.member.addr)
                    .collect();
                alive.choose(&mut rand::thread_rng()).copied()
            };
            if let Some(target) = target {
                let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
                let ping = Message::Ping {
                    from: self.config.node_name.clone(),
                    seq,
                };
                self.send(target, &ping).await;
            }

            if self.dirty.swap(false, Ordering::Relaxed) {
                if let Err(e) = self.write_snapshot(false).await {
                    debug!(target: "udup_cluster::gossip", error = %e, "Failed to write snapshot");
                }
            }
        }
    }

    async fn detect_failures(&self) {
        let failed: Vec<Member> = {
            let mut peers = self.peers.write().await;
            let now = Instant::now();
            peers
                .values_mut()
                .filter(|p| {
                    p.member.is_alive()
                        && now.duration_since(p.last_seen) > self.config.suspect_timeout
                })
                .map(|p| {
                    p.member.status = MemberStatus::Failed;
                    p.changed_at = now;
                    p.member.clone()
                })
                .collect()
        };
        for member in failed {
            debug!(target: "udup_cluster::gossip", node = %member.name, "Member failed");
            self.emit(MemberEventKind::Failed, member);
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.reconnect_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.reap().await;
            self.reconnect().await;
        }
    }

    async fn reap(&self) {
        let reaped: Vec<Member> = {
            let mut peers = self.peers.write().await;
            let now = Instant::now();
            let expired: Vec<String> = peers
                .values()
                .filter(|p| {
                    let age = now.duration_since(p.changed_at);
                    match p.member.status {
                        MemberStatus::Failed => age > self.config.reconnect_timeout,
                        MemberStatus::Left => age > self.config.tombstone_timeout,
                        _ => false,
                    }
                })
                .map(|p| p.member.name.clone())
                .collect();
            expired
                .iter()
                .filter_map(|name| peers.remove(name))
                .map(|p| p.member)
                .collect()
        };
        for member in reaped {
            debug!(target: "udup_cluster::gossip", node = %member.name, "Member reaped");
            self.emit(MemberEventKind::Reap, member);
        }
    }

    async fn reconnect(&self) {
        let target = {
            let peers = self.peers.read().await;
            let failed: Vec<SocketAddr> = peers
                .values()
                .filter(|p| p.member.status == MemberStatus::Failed)
                .map(|p| p.member.addr)
                .collect();
            failed.choose(&mut rand::thread_rng()).copied()
        };
        if let Some(target) = target {
            debug!(target: "udup_cluster::gossip", addr = %target, "Attempting reconnect");
            let message = Message::Join {
                member: self.local_wire().await,
            };
            self.send(target, &message).await;
        }
    }

    async fn write_snapshot(&self, left: bool) -> Result<(), GossipError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        let peers = {
            let peers = self.peers.read().await;
            let mut list: Vec<SnapshotPeer> = peers
                .values()
                .filter(|p| p.member.status != MemberStatus::Left)
                .map(|p| SnapshotPeer {
                    name: p.member.name.clone(),
                    addr: p.member.addr,
                })
                .collect();
            list.sort_by(|a, b| a.name.cmp(&b.name));
            list
        };
        let snapshot = Snapshot {
            clock: self.clock.time(),
            left,
            peers,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&snapshot)?).await?;
        Ok(())
    }
}

async fn read_snapshot(path: &Path) -> Result<Snapshot, GossipError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                debug!(
                    target: "udup_cluster::gossip",
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable snapshot"
                );
                Ok(Snapshot::default())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
        Err(e) => Err(e.into()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Batch member events.
///
/// A batch is flushed `coalesce` after its first event, or earlier once no
/// event arrived for `quiescent`. Within a batch only the latest change of
/// each member is kept.
async fn coalesce_loop(
    mut rx: mpsc::UnboundedReceiver<MemberEvent>,
    tx: mpsc::Sender<Event>,
    coalesce: Duration,
    quiescent: Duration,
    token: CancellationToken,
) {
    let mut pending: BTreeMap<String, (MemberEventKind, Member)> = BTreeMap::new();
    let mut flush_by: Option<Instant> = None;
    let mut quiet_by: Option<Instant> = None;

    loop {
        let deadline = match (flush_by, quiet_by) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if coalesce.is_zero() {
                    if tx.send(Event::Member(event)).await.is_err() {
                        break;
                    }
                    continue;
                }
                let now = Instant::now();
                flush_by.get_or_insert(now + coalesce);
                quiet_by = Some(now + quiescent);
                for member in event.members {
                    pending.insert(member.name.clone(), (event.kind, member));
                }
            }
            _ = sleep_until(deadline) => {
                flush_by = None;
                quiet_by = None;
                for event in drain_batch(&mut pending) {
                    if tx.send(Event::Member(event)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn drain_batch(pending: &mut BTreeMap<String, (MemberEventKind, Member)>) -> Vec<MemberEvent> {
    let order = [
        MemberEventKind::Join,
        MemberEventKind::Update,
        MemberEventKind::Leave,
        MemberEventKind::Failed,
        MemberEventKind::Reap,
    ];
    let batch = std::mem::take(pending);
    order
        .iter()
        .filter_map(|kind| {
            let members: Vec<Member> = batch
                .values()
                .filter(|(k, _)| k == kind)
                .map(|(_, m)| m.clone())
                .collect();
            (!members.is_empty()).then(|| MemberEvent {
                kind: *kind,
                members,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> (GossipConfig, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let mut config = GossipConfig::new(name, "127.0.0.1:0".parse().unwrap(), tx);
        config.query_size_limit = 10 * 1024;
        config.query_response_size_limit = 10 * 1024;
        config.probe_interval = Duration::from_millis(50);
        (config, rx)
    }

    async fn next_member_event(rx: &mut mpsc::Receiver<Event>) -> MemberEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if let Event::Member(event) = event {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_join_exchanges_members() {
        let (c1, mut rx1) = config("n1");
        let (c2, mut rx2) = config("n2");
        let g1 = UdpGossip::create(c1).await.unwrap();
        let g2 = UdpGossip::create(c2).await.unwrap();

        let seed = g1.local_addr().await.to_string();
        assert_eq!(g2.join(&[seed], true).await.unwrap(), 1);

        assert_eq!(g1.members().await.len(), 2);
        assert_eq!(g2.members().await.len(), 2);

        let ev = next_member_event(&mut rx1).await;
        assert_eq!(ev.kind, MemberEventKind::Join);
        assert_eq!(ev.members[0].name, "n2");
        let ev = next_member_event(&mut rx2).await;
        assert_eq!(ev.members[0].name, "n1");

        g1.leave().await.unwrap();
        g2.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unreachable_fails() {
        let (c1, _rx1) = config("n1");
        let g1 = UdpGossip::create(c1).await.unwrap();
        // bound and immediately released, nothing answers there
        let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = g1.join(&[dead.to_string()], false).await.unwrap_err();
        assert!(matches!(err, GossipError::JoinFailed { attempted: 1 }));
        assert_eq!(g1.join(&[], false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (c1, _rx1) = config("n1");
        let (c2, _rx2) = config("n2");
        let (c3, _rx3) = config("n2");
        let g1 = UdpGossip::create(c1).await.unwrap();
        let g2 = UdpGossip::create(c2).await.unwrap();
        let g3 = UdpGossip::create(c3).await.unwrap();

        let seed = g1.local_addr().await.to_string();
        g2.join(&[seed.clone()], false).await.unwrap();
        let err = g3.join(&[seed], false).await.unwrap_err();
        assert!(matches!(err, GossipError::NameConflict(name) if name == "n2"));
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let (c1, _rx1) = config("n1");
        let (c2, mut rx2) = config("n2");
        let g1 = UdpGossip::create(c1).await.unwrap();
        let g2 = UdpGossip::create(c2).await.unwrap();
        g2.join(&[g1.local_addr().await.to_string()], false).await.unwrap();

        let responder = tokio::spawn(async move {
            while let Some(event) = rx2.recv().await {
                if let Event::Query(query) = event {
                    assert_eq!(query.name(), "rpc-config");
                    let (_, sink) = query.into_parts();
                    sink.respond(b"127.0.0.1:8191".to_vec()).unwrap();
                    return;
                }
            }
        });

        let mut responses = g1
            .query("rpc-config", Vec::new(), QueryParams::node("n2", Duration::from_secs(2)))
            .await
            .unwrap();
        let response = responses.recv().await.unwrap();
        assert_eq!(response.from, "n2");
        assert_eq!(response.payload, b"127.0.0.1:8191");
        // every target answered, so the stream ends early
        assert!(responses.recv().await.is_none());
        responder.await.unwrap();
    }

    async fn next_query(rx: &mut mpsc::Receiver<Event>, wait: Duration) -> Option<Query> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Event::Query(query))) => return Some(query),
                Ok(Some(Event::Member(_))) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    fn raw_query(id: u64, ltime: u64, origin_addr: SocketAddr) -> Vec<u8> {
        serde_json::to_vec(&Message::Query {
            id,
            origin: "n1".to_string(),
            origin_addr,
            ltime: LogicalTime::from_raw(ltime),
            name: "run-job".to_string(),
            payload: Vec::new(),
            filter: Vec::new(),
            timeout_ms: 100,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_without_replay_drops_older_queries() {
        let (c1, _rx1) = config("n1");
        let (c2, mut rx2) = config("n2");
        let g1 = UdpGossip::create(c1).await.unwrap();
        let g2 = UdpGossip::create(c2).await.unwrap();

        for _ in 0..3 {
            g1.query("scheduler-restart", Vec::new(), QueryParams::broadcast(Duration::from_millis(50)))
                .await
                .unwrap();
        }
        let clock = g1.shared.clock.time().as_u64();
        assert!(clock >= 3);

        let (c3, mut rx3) = config("n3");
        let g3 = UdpGossip::create(c3).await.unwrap();
        let g1_addr = g1.local_addr().await;
        assert_eq!(g2.join(&[g1_addr.to_string()], true).await.unwrap(), 1);
        assert_eq!(g3.join(&[g1_addr.to_string()], false).await.unwrap(), 1);
        let g2_addr = g2.local_addr().await;
        let g3_addr = g3.local_addr().await;

        let wire = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let old = raw_query(100, clock, g1_addr);
        wire.send_to(&old, g2_addr).await.unwrap();
        wire.send_to(&old, g3_addr).await.unwrap();
        assert!(next_query(&mut rx2, Duration::from_millis(300)).await.is_none());
        // replay was allowed on n3
        assert!(next_query(&mut rx3, Duration::from_secs(5)).await.is_some());

        wire.send_to(&raw_query(101, clock + 5, g1_addr), g2_addr).await.unwrap();
        let query = next_query(&mut rx2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(query.name(), "run-job");
        assert_eq!(query.ltime(), LogicalTime::from_raw(clock + 5));
    }

    #[tokio::test]
    async fn test_query_too_large() {
        let (c1, _rx1) = config("n1");
        let g1 = UdpGossip::create(c1).await.unwrap();
        let err = g1
            .query("run-job", vec![0; 11 * 1024], QueryParams::broadcast(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, GossipError::QueryTooLarge { size, limit } if size == 11 * 1024 && limit == 10 * 1024));
    }

    #[tokio::test]
    async fn test_leave_notifies_and_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("serf").join("snapshot");

        let (c1, mut rx1) = config("n1");
        let (mut c2, _rx2) = config("n2");
        c2.snapshot_path = Some(snapshot_path.clone());
        let g1 = UdpGossip::create(c1).await.unwrap();
        let g2 = UdpGossip::create(c2).await.unwrap();
        g2.join(&[g1.local_addr().await.to_string()], false).await.unwrap();
        assert_eq!(next_member_event(&mut rx1).await.kind, MemberEventKind::Join);

        g2.leave().await.unwrap();
        assert!(g2.shutdown_token().is_cancelled());
        // second leave is a no-op
        g2.leave().await.unwrap();

        let ev = next_member_event(&mut rx1).await;
        assert_eq!(ev.kind, MemberEventKind::Leave);
        assert_eq!(ev.members[0].status, MemberStatus::Left);

        let snapshot = read_snapshot(&snapshot_path).await.unwrap();
        assert!(snapshot.left);
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].name, "n1");
    }

    #[tokio::test]
    async fn test_silent_member_marked_failed() {
        let (mut c1, mut rx1) = config("n1");
        c1.suspect_timeout = Duration::from_millis(200);
        let (c2, _rx2) = config("n2");
        let g1 = UdpGossip::create(c1).await.unwrap();
        let g2 = UdpGossip::create(c2).await.unwrap();
        g2.join(&[g1.local_addr().await.to_string()], false).await.unwrap();
        assert_eq!(next_member_event(&mut rx1).await.kind, MemberEventKind::Join);

        // stop n2 without a leave message
        g2.shutdown_token().cancel();

        let ev = next_member_event(&mut rx1).await;
        assert_eq!(ev.kind, MemberEventKind::Failed);
        assert_eq!(ev.members[0].name, "n2");
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = read_snapshot(&dir.path().join("absent")).await.unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[test]
    fn test_seen_queries_dedupe_and_evict() {
        let mut seen = SeenQueries::default();
        assert!(seen.insert("n1", 1));
        assert!(!seen.insert("n1", 1));
        assert!(seen.insert("n2", 1));
        for id in 0..SEEN_QUERY_CAPACITY as u64 {
            seen.insert("n3", id);
        }
        assert!(seen.insert("n1", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_batches_member_events() {
        let (member_tx, member_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        tokio::spawn(coalesce_loop(
            member_rx,
            tx,
            Duration::from_secs(6),
            Duration::from_secs(1),
            token.clone(),
        ));

        let addr: SocketAddr = "127.0.0.1:7946".parse().unwrap();
        for name in ["a", "b"] {
            member_tx
                .send(MemberEvent {
                    kind: MemberEventKind::Join,
                    members: vec![Member::new(name, addr)],
                })
                .unwrap();
        }
        member_tx
            .send(MemberEvent {
                kind: MemberEventKind::Failed,
                members: vec![Member::new("a", addr).with_status(MemberStatus::Failed)],
            })
            .unwrap();

        let started = Instant::now();
        let Some(Event::Member(first)) = rx.recv().await else {
            panic!("expected member event");
        };
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(first.kind, MemberEventKind::Join);
        assert_eq!(first.members.len(), 1);
        assert_eq!(first.members[0].name, "b");

        let Some(Event::Member(second)) = rx.recv().await else {
            panic!("expected member event");
        };
        assert_eq!(second.kind, MemberEventKind::Failed);
        assert_eq!(second.members[0].name, "a");
        token.cancel();
    }
}
