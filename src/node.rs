//! Kademlia node runtime.
//!
//! A [`KadNode`] owns its routing table, value store and every outstanding
//! request. It never blocks and never spawns: each entry point runs to
//! completion against a [`Ctx`] that lends it the scheduler, the transport
//! and the random source for the duration of the call.
//!
//! # Requests
//!
//! Every outbound request is recorded under its [`RpcId`] together with the
//! scheduler [`Owner`] of its timeout job. A response is accepted only when
//! both the id and the sender's address match the record; anything else is
//! counted and dropped. On timeout the request is resent until the retry
//! budget (`attempts_number`) is spent, after which the peer is treated as
//! down and leaves the routing table.
//!
//! # Completions
//!
//! User operations return an [`OpId`] immediately and finish later with a
//! [`NodeEvent`], drained through [`KadNode::take_events`]. Shutting the node
//! down completes every open operation with [`Status::Terminated`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;

use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::contact::{Contact, NodeInfo};
use crate::id::NodeId;
use crate::kbucket::AddOutcome;
use crate::lookup::{Search, SearchId, SearchKind, SearchPurpose};
use crate::net::Transport;
use crate::protocol::{
    DownlistRequest, DownlistResponse, FindNodeRequest, FindNodeResponse, FindValueRequest,
    FindValueResponse, Header, Message, PingRequest, PingResponse, RpcId, RpcKind, StoreRequest,
    StoreResponse,
};
use crate::routing::RoutingTable;
use crate::scheduler::{Owner, Scheduler, Timestamp};
use crate::stats::{NodeStats, TelemetrySnapshot};
use crate::store::ValueStore;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Work item in the shared scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    /// Hand a message to its destination. Queued by in-process transports.
    Deliver(Message),
    /// Run a node-internal task on the node at `addr`.
    Node { addr: SocketAddr, task: NodeTask },
}

/// Timer-driven work of a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeTask {
    /// The request with this id has not been answered in time.
    Timeout(RpcId),
    /// A stored item is due for republishing.
    Republish { key: NodeId, value: Vec<u8> },
    /// Periodic routing-table staleness check.
    RoutingCheck,
}

/// Borrowed runtime services handed to every node entry point.
pub struct Ctx<'a> {
    pub scheduler: &'a mut Scheduler<Job>,
    pub transport: &'a mut dyn Transport,
    pub rng: &'a mut StdRng,
}

impl<'a> Ctx<'a> {
    pub fn new(
        scheduler: &'a mut Scheduler<Job>,
        transport: &'a mut dyn Transport,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            scheduler,
            transport,
            rng,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.scheduler.now()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations and completions
// ─────────────────────────────────────────────────────────────────────────────

/// Handle of a user operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OpId(pub u64);

/// Final result code of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Success,
    /// No peer could complete the operation.
    Failed,
    /// The node shut down before the operation finished.
    Terminated,
}

/// Completion of a user operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Ping {
        op: OpId,
        peer: SocketAddr,
        status: Status,
    },
    FindNode {
        op: OpId,
        target: NodeId,
        status: Status,
        nodes: Vec<NodeInfo>,
    },
    FindValue {
        op: OpId,
        key: NodeId,
        status: Status,
        values: Vec<Vec<u8>>,
    },
    Store {
        op: OpId,
        key: NodeId,
        status: Status,
        /// Peers that acknowledged the value.
        replicas: usize,
    },
    Join {
        op: OpId,
        status: Status,
    },
}

impl NodeEvent {
    pub fn op(&self) -> OpId {
        match self {
            NodeEvent::Ping { op, .. }
            | NodeEvent::FindNode { op, .. }
            | NodeEvent::FindValue { op, .. }
            | NodeEvent::Store { op, .. }
            | NodeEvent::Join { op, .. } => *op,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            NodeEvent::Ping { status, .. }
            | NodeEvent::FindNode { status, .. }
            | NodeEvent::FindValue { status, .. }
            | NodeEvent::Store { status, .. }
            | NodeEvent::Join { status, .. } => *status,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// Why a request was sent; decides what its answer or failure feeds into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RpcPurpose {
    Ping(OpId),
    JoinPing,
    /// Liveness check of a node someone reported dead.
    DownlistCheck,
    Find(SearchId),
    Store(u64),
    /// Direct replica push after churn.
    Replicate,
    Downlist,
}

#[derive(Debug)]
struct PendingRpc {
    request: Message,
    addr: SocketAddr,
    /// Peer id, when known before the answer arrives.
    peer: Option<NodeId>,
    attempts: u32,
    owner: Owner,
    purpose: RpcPurpose,
}

/// Payload of an accepted response.
enum Reply {
    Ack,
    Nodes(Vec<NodeInfo>),
    Values {
        nodes: Vec<NodeInfo>,
        values: Vec<Vec<u8>>,
    },
}

/// Second phase of a store: STORE requests to the lookup's result set.
#[derive(Debug)]
struct StoreOp {
    op: Option<OpId>,
    key: NodeId,
    value: Vec<u8>,
    outstanding: usize,
    acked: Vec<NodeId>,
}

#[derive(Debug)]
struct JoinState {
    op: OpId,
    bootstrap: VecDeque<SocketAddr>,
    in_flight: usize,
    successes: usize,
    lookup_started: bool,
    retried: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Kademlia node
// ─────────────────────────────────────────────────────────────────────────────

/// A single DHT participant.
#[derive(Debug)]
pub struct KadNode {
    info: NodeInfo,
    config: Config,
    routing: RoutingTable,
    store: ValueStore,
    pending: HashMap<RpcId, PendingRpc>,
    searches: BTreeMap<SearchId, Search>,
    store_ops: BTreeMap<u64, StoreOp>,
    join: Option<JoinState>,
    events: VecDeque<NodeEvent>,
    stats: NodeStats,
    /// Owner of the periodic routing-table check.
    maintenance: Option<Owner>,
    next_rpc_id: RpcId,
    next_op: u64,
    next_search: u64,
    next_store_op: u64,
    joined: bool,
    terminated: bool,
}

impl KadNode {
    pub fn new(id: NodeId, addr: SocketAddr, config: Config) -> Self {
        Self {
            info: NodeInfo::new(id, addr),
            routing: RoutingTable::new(id, config.k, config.force_k),
            store: ValueStore::new(addr, &config),
            config,
            pending: HashMap::new(),
            searches: BTreeMap::new(),
            store_ops: BTreeMap::new(),
            join: None,
            events: VecDeque::new(),
            stats: NodeStats::default(),
            maintenance: None,
            next_rpc_id: 0,
            next_op: 0,
            next_search: 0,
            next_store_op: 0,
            joined: false,
            terminated: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    pub fn info(&self) -> NodeInfo {
        self.info
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn value_store(&self) -> &ValueStore {
        &self.store
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// No request, search, store fan-out or join in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.searches.is_empty()
            && self.store_ops.is_empty()
            && self.join.is_none()
    }

    pub fn pending_rpcs(&self) -> usize {
        self.pending.len()
    }

    /// Drain completions produced since the last call.
    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        self.events.drain(..).collect()
    }

    pub fn telemetry(&self, now: Timestamp) -> TelemetrySnapshot {
        TelemetrySnapshot {
            node_id: self.info.id.to_string(),
            joined: self.joined,
            routing_table_size: self.routing.len(),
            bucket_count: self.routing.bucket_count(),
            holder_bucket_size: self.routing.holder_bucket().len(),
            stored_items: self.store.live_len(now),
            pending_rpcs: self.pending.len(),
            active_searches: self.searches.len(),
            rpc: self.stats.rpc.clone(),
            requests_per_lookup: self.stats.requests_per_lookup.clone(),
            lookups_completed: self.stats.lookups_completed,
            lookups_failed: self.stats.lookups_failed,
            stores_completed: self.stats.stores_completed,
            stores_failed: self.stats.stores_failed,
            republished: self.stats.republished,
            expired: self.stats.expired,
        }
    }

    /// Offer a peer to the routing table without talking to it.
    pub fn add_contact(&mut self, ctx: &mut Ctx<'_>, info: NodeInfo) -> AddOutcome {
        self.observe(ctx, info)
    }

    // ── user operations ─────────────────────────────────────────────────────

    /// Probe `addr` for liveness.
    pub fn ping(&mut self, ctx: &mut Ctx<'_>, addr: SocketAddr) -> OpId {
        let op = self.next_op();
        if self.terminated {
            self.emit(NodeEvent::Ping {
                op,
                peer: addr,
                status: Status::Terminated,
            });
            return op;
        }
        let peer = self.routing.contacts().find(|c| c.addr == addr).map(|c| c.id);
        self.send_request(ctx, addr, peer, RpcPurpose::Ping(op), |header| {
            Message::PingRequest(PingRequest { header })
        });
        op
    }

    /// Iterative lookup of the `k` live nodes closest to `target`.
    pub fn find_node(&mut self, ctx: &mut Ctx<'_>, target: NodeId) -> OpId {
        let op = self.next_op();
        if self.terminated {
            self.emit(NodeEvent::FindNode {
                op,
                target,
                status: Status::Terminated,
                nodes: Vec::new(),
            });
            return op;
        }
        self.start_search(ctx, target, SearchKind::FindNode, SearchPurpose::User(op));
        op
    }

    /// Fetch the values stored under `key`, locally first.
    pub fn find_value(&mut self, ctx: &mut Ctx<'_>, key: NodeId) -> OpId {
        let op = self.next_op();
        if self.terminated {
            self.emit(NodeEvent::FindValue {
                op,
                key,
                status: Status::Terminated,
                values: Vec::new(),
            });
            return op;
        }
        let local = self.store.get_items(ctx.now(), &key);
        if !local.is_empty() {
            trace!(%key, "value served from local store");
            self.emit(NodeEvent::FindValue {
                op,
                key,
                status: Status::Success,
                values: local,
            });
            return op;
        }
        self.start_search(ctx, key, SearchKind::FindValue, SearchPurpose::User(op));
        op
    }

    /// Replicate `(key, value)` on the `k` nodes closest to `key`.
    pub fn store(&mut self, ctx: &mut Ctx<'_>, key: NodeId, value: Vec<u8>, ttl: u64) -> OpId {
        let op = self.next_op();
        if self.terminated {
            self.emit(NodeEvent::Store {
                op,
                key,
                status: Status::Terminated,
                replicas: 0,
            });
            return op;
        }
        let purpose = SearchPurpose::Store {
            op: Some(op),
            key,
            value,
            ttl,
        };
        self.start_search(ctx, key, SearchKind::FindNode, purpose);
        op
    }

    /// [`KadNode::store`] with the configured `expiration_time`.
    pub fn store_default(&mut self, ctx: &mut Ctx<'_>, key: NodeId, value: Vec<u8>) -> OpId {
        let ttl = self.config.expiration_time;
        self.store(ctx, key, value, ttl)
    }

    /// Enter the network through `bootstrap` addresses.
    pub fn join(&mut self, ctx: &mut Ctx<'_>, bootstrap: impl IntoIterator<Item = SocketAddr>) -> OpId {
        let op = self.next_op();
        if self.terminated {
            self.emit(NodeEvent::Join {
                op,
                status: Status::Terminated,
            });
            return op;
        }
        if self.join.is_some() {
            debug!(node = %self.info.id, "join already in progress");
            self.emit(NodeEvent::Join {
                op,
                status: Status::Failed,
            });
            return op;
        }
        let own = self.info.addr;
        self.join = Some(JoinState {
            op,
            bootstrap: bootstrap.into_iter().filter(|a| *a != own).collect(),
            in_flight: 0,
            successes: 0,
            lookup_started: false,
            retried: false,
        });
        self.pump_join(ctx);
        op
    }

    /// Shut down: every open operation completes with
    /// [`Status::Terminated`] and every scheduled job of this node is
    /// cancelled.
    pub fn terminate(&mut self, ctx: &mut Ctx<'_>) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for (_, record) in std::mem::take(&mut self.pending) {
            ctx.scheduler.cancel_all(record.owner);
            if let RpcPurpose::Ping(op) = record.purpose {
                self.emit(NodeEvent::Ping {
                    op,
                    peer: record.addr,
                    status: Status::Terminated,
                });
            }
        }

        for (_, search) in std::mem::take(&mut self.searches) {
            match search.purpose {
                SearchPurpose::User(op) => self.emit_search_result(
                    op,
                    search.kind,
                    search.target,
                    Status::Terminated,
                    Vec::new(),
                    Vec::new(),
                ),
                SearchPurpose::Store { op: Some(op), key, .. } => self.emit(NodeEvent::Store {
                    op,
                    key,
                    status: Status::Terminated,
                    replicas: 0,
                }),
                _ => {}
            }
        }

        for (_, store_op) in std::mem::take(&mut self.store_ops) {
            if let Some(op) = store_op.op {
                self.emit(NodeEvent::Store {
                    op,
                    key: store_op.key,
                    status: Status::Terminated,
                    replicas: store_op.acked.len(),
                });
            }
        }

        if let Some(join) = self.join.take() {
            self.emit(NodeEvent::Join {
                op: join.op,
                status: Status::Terminated,
            });
        }

        if let Some(owner) = self.maintenance.take() {
            ctx.scheduler.cancel_all(owner);
        }
        self.store.clear(ctx);
        debug!(node = %self.info.id, events = self.events.len(), "node terminated");
    }

    // ── inbound dispatch ────────────────────────────────────────────────────

    /// Entry point for every message addressed to this node.
    pub fn handle_message(&mut self, ctx: &mut Ctx<'_>, message: Message) {
        if self.terminated {
            return;
        }
        match message {
            Message::PingRequest(m) => self.on_ping_request(ctx, m),
            Message::PingResponse(m) => self.on_ping_response(ctx, m),
            Message::StoreRequest(m) => self.on_store_request(ctx, m),
            Message::StoreResponse(m) => self.on_store_response(ctx, m),
            Message::FindNodeRequest(m) => self.on_find_node_request(ctx, m),
            Message::FindNodeResponse(m) => self.on_find_node_response(ctx, m),
            Message::FindValueRequest(m) => self.on_find_value_request(ctx, m),
            Message::FindValueResponse(m) => self.on_find_value_response(ctx, m),
            Message::DownlistRequest(m) => self.on_downlist_request(ctx, m),
            Message::DownlistResponse(m) => self.on_downlist_response(ctx, m),
        }
    }

    /// Entry point for this node's timer jobs.
    pub fn handle_task(&mut self, ctx: &mut Ctx<'_>, task: NodeTask) {
        if self.terminated {
            return;
        }
        match task {
            NodeTask::Timeout(rpc_id) => self.on_timeout(ctx, rpc_id),
            NodeTask::Republish { key, value } => self.on_republish(ctx, key, value),
            NodeTask::RoutingCheck => self.on_routing_check(ctx),
        }
    }

    pub fn on_ping_request(&mut self, ctx: &mut Ctx<'_>, msg: PingRequest) {
        self.accept_request(ctx, &msg.header, RpcKind::Ping);
        ctx.transport.send_ping_response(PingResponse {
            header: msg.header.reply(self.info.id),
        });
    }

    pub fn on_store_request(&mut self, ctx: &mut Ctx<'_>, msg: StoreRequest) {
        self.accept_request(ctx, &msg.header, RpcKind::Store);
        self.store.store(ctx, msg.key, msg.value, msg.ttl);
        ctx.transport.send_store_response(StoreResponse {
            header: msg.header.reply(self.info.id),
        });
    }

    pub fn on_find_node_request(&mut self, ctx: &mut Ctx<'_>, msg: FindNodeRequest) {
        self.accept_request(ctx, &msg.header, RpcKind::FindNode);
        let nodes = self.closest_for(&msg.target, &msg.header.node_id);
        ctx.transport.send_find_node_response(FindNodeResponse {
            header: msg.header.reply(self.info.id),
            nodes,
        });
    }

    pub fn on_find_value_request(&mut self, ctx: &mut Ctx<'_>, msg: FindValueRequest) {
        self.accept_request(ctx, &msg.header, RpcKind::FindValue);
        let values = self.store.get_items(ctx.now(), &msg.key);
        let nodes = if values.is_empty() {
            self.closest_for(&msg.key, &msg.header.node_id)
        } else {
            Vec::new()
        };
        ctx.transport.send_find_value_response(FindValueResponse {
            header: msg.header.reply(self.info.id),
            nodes,
            values,
        });
    }

    /// Ping every reported node we still route to; unanswered pings evict it.
    pub fn on_downlist_request(&mut self, ctx: &mut Ctx<'_>, msg: DownlistRequest) {
        self.accept_request(ctx, &msg.header, RpcKind::Downlist);
        for id in &msg.nodes {
            if *id == self.info.id || *id == msg.header.node_id {
                continue;
            }
            let Some(addr) = self.routing.get_contact(id).map(|c| c.addr) else {
                continue;
            };
            let already_checking = self
                .pending
                .values()
                .any(|r| r.peer == Some(*id) && r.purpose == RpcPurpose::DownlistCheck);
            if already_checking {
                continue;
            }
            trace!(peer = %id, reporter = %msg.header.node_id, "checking reported-down contact");
            self.send_request(ctx, addr, Some(*id), RpcPurpose::DownlistCheck, |header| {
                Message::PingRequest(PingRequest { header })
            });
        }
        ctx.transport.send_downlist_response(DownlistResponse {
            header: msg.header.reply(self.info.id),
        });
    }

    pub fn on_ping_response(&mut self, ctx: &mut Ctx<'_>, msg: PingResponse) {
        self.on_response(ctx, msg.header, RpcKind::Ping, Reply::Ack);
    }

    pub fn on_store_response(&mut self, ctx: &mut Ctx<'_>, msg: StoreResponse) {
        self.on_response(ctx, msg.header, RpcKind::Store, Reply::Ack);
    }

    pub fn on_find_node_response(&mut self, ctx: &mut Ctx<'_>, msg: FindNodeResponse) {
        self.on_response(ctx, msg.header, RpcKind::FindNode, Reply::Nodes(msg.nodes));
    }

    pub fn on_find_value_response(&mut self, ctx: &mut Ctx<'_>, msg: FindValueResponse) {
        let reply = Reply::Values {
            nodes: msg.nodes,
            values: msg.values,
        };
        self.on_response(ctx, msg.header, RpcKind::FindValue, reply);
    }

    pub fn on_downlist_response(&mut self, ctx: &mut Ctx<'_>, msg: DownlistResponse) {
        self.on_response(ctx, msg.header, RpcKind::Downlist, Reply::Ack);
    }

    // ── request/response plumbing ───────────────────────────────────────────

    fn accept_request(&mut self, ctx: &mut Ctx<'_>, header: &Header, kind: RpcKind) {
        self.stats.record_request(kind);
        self.observe(ctx, header.sender());
    }

    /// Up to `k` contacts closest to `target`, never including `requester`.
    fn closest_for(&self, target: &NodeId, requester: &NodeId) -> Vec<NodeInfo> {
        self.routing
            .get_closest_contacts(target, self.config.k + 1)
            .into_iter()
            .filter(|c| c.id != *requester)
            .take(self.config.k)
            .map(|c| c.info())
            .collect()
    }

    fn send_request<F>(
        &mut self,
        ctx: &mut Ctx<'_>,
        addr: SocketAddr,
        peer: Option<NodeId>,
        purpose: RpcPurpose,
        build: F,
    ) -> RpcId
    where
        F: FnOnce(Header) -> Message,
    {
        let rpc_id = self.alloc_rpc_id();
        let header = Header {
            from: self.info.addr,
            to: addr,
            rpc_id,
            node_id: self.info.id,
        };
        let request = build(header);
        self.stats.record_sent(request.kind());
        ctx.transport.send(request.clone());

        let owner = ctx.scheduler.new_owner();
        self.schedule_timeout(ctx, owner, rpc_id);
        self.pending.insert(
            rpc_id,
            PendingRpc {
                request,
                addr,
                peer,
                attempts: 0,
                owner,
                purpose,
            },
        );
        rpc_id
    }

    fn schedule_timeout(&self, ctx: &mut Ctx<'_>, owner: Owner, rpc_id: RpcId) {
        ctx.scheduler.schedule_after(
            self.config.timeout_period,
            owner,
            Job::Node {
                addr: self.info.addr,
                task: NodeTask::Timeout(rpc_id),
            },
        );
    }

    fn alloc_rpc_id(&mut self) -> RpcId {
        loop {
            let id = self.next_rpc_id;
            self.next_rpc_id = self.next_rpc_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn on_timeout(&mut self, ctx: &mut Ctx<'_>, rpc_id: RpcId) {
        let Some(record) = self.pending.get_mut(&rpc_id) else {
            return;
        };
        if record.attempts < self.config.attempts_number {
            record.attempts += 1;
            let (owner, attempt, kind) = (record.owner, record.attempts, record.request.kind());
            trace!(rpc_id, peer = %record.addr, attempt, "request timed out, resending");
            ctx.transport.send(record.request.clone());
            self.stats.record_sent(kind);
            self.stats.rpc.retries += 1;
            self.schedule_timeout(ctx, owner, rpc_id);
            return;
        }

        let Some(record) = self.pending.remove(&rpc_id) else {
            return;
        };
        ctx.scheduler.cancel_all(record.owner);
        self.stats.rpc.timeouts += 1;
        debug!(rpc_id, peer = %record.addr, kind = record.request.kind().as_str(), "peer unresponsive");
        if let Some(peer) = record.peer {
            self.drop_contact(ctx, &peer);
        }

        match record.purpose {
            RpcPurpose::Ping(op) => self.emit(NodeEvent::Ping {
                op,
                peer: record.addr,
                status: Status::Failed,
            }),
            RpcPurpose::JoinPing => self.join_ping_done(ctx, false),
            RpcPurpose::Find(sid) => {
                if let (Some(search), Some(peer)) = (self.searches.get_mut(&sid), record.peer) {
                    search.on_failure(&peer);
                }
                self.drive_search(ctx, sid);
            }
            RpcPurpose::Store(store_op) => self.store_acked(store_op, None),
            RpcPurpose::DownlistCheck | RpcPurpose::Replicate | RpcPurpose::Downlist => {}
        }
    }

    fn on_response(&mut self, ctx: &mut Ctx<'_>, header: Header, kind: RpcKind, reply: Reply) {
        self.stats.record_response(kind);
        let matched = self
            .pending
            .get(&header.rpc_id)
            .is_some_and(|r| r.addr == header.from);
        if !matched {
            self.stats.rpc.unmatched_responses += 1;
            trace!(rpc_id = header.rpc_id, from = %header.from, "dropping unmatched response");
            return;
        }
        let Some(record) = self.pending.remove(&header.rpc_id) else {
            return;
        };
        ctx.scheduler.cancel_all(record.owner);
        self.observe(ctx, header.sender());

        match record.purpose {
            RpcPurpose::Ping(op) => self.emit(NodeEvent::Ping {
                op,
                peer: header.from,
                status: Status::Success,
            }),
            RpcPurpose::JoinPing => self.join_ping_done(ctx, true),
            RpcPurpose::Find(sid) => {
                let candidate = record.peer.unwrap_or(header.node_id);
                self.on_find_reply(ctx, sid, &candidate, reply);
            }
            RpcPurpose::Store(store_op) => self.store_acked(store_op, Some(header.node_id)),
            RpcPurpose::DownlistCheck | RpcPurpose::Replicate | RpcPurpose::Downlist => {}
        }
    }

    /// Feed a peer into the routing table; newly added peers may receive
    /// replicas of nearby items.
    fn observe(&mut self, ctx: &mut Ctx<'_>, peer: NodeInfo) -> AddOutcome {
        if peer.id == self.info.id {
            return AddOutcome::Existed;
        }
        let now = ctx.now();
        let (outcome, is_close) = self.routing.add_contact(Contact::new(peer, now));
        if outcome == AddOutcome::Success {
            trace!(node = %self.info.id, peer = %peer.id, is_close, "new contact");
            let pushes = self
                .store
                .on_new_contact(now, &peer.id, is_close, self.joined, self.close_range_filter());
            for push in pushes {
                trace!(key = %push.key, peer = %peer.id, "pushing replica to new contact");
                self.send_request(ctx, peer.addr, Some(peer.id), RpcPurpose::Replicate, |header| {
                    Message::StoreRequest(StoreRequest {
                        header,
                        key: push.key,
                        value: push.value,
                        ttl: push.ttl,
                    })
                });
            }
        }
        outcome
    }

    fn drop_contact(&mut self, ctx: &mut Ctx<'_>, id: &NodeId) {
        let (removed, was_close) = self.routing.remove_contact(id);
        if !removed {
            return;
        }
        debug!(node = %self.info.id, peer = %id, was_close, "contact down, removed from routing table");
        let filter = self.close_range_filter();
        self.store.on_remove_contact(ctx, was_close, filter);
    }

    /// Snapshot of the holder's close range for store churn reactions.
    fn close_range_filter(&self) -> impl Fn(&NodeId) -> bool {
        let holder = self.info.id;
        let radius = self.routing.close_radius();
        move |key: &NodeId| radius.map_or(true, |r| holder.distance(key) <= r)
    }

    // ── lookups ─────────────────────────────────────────────────────────────

    fn start_search(
        &mut self,
        ctx: &mut Ctx<'_>,
        target: NodeId,
        kind: SearchKind,
        purpose: SearchPurpose,
    ) -> SearchId {
        let sid = SearchId(self.next_search);
        self.next_search += 1;
        self.routing.mark_lookup(&target, ctx.now());

        let seeds = self
            .routing
            .get_closest_contacts(&target, self.config.k)
            .into_iter()
            .map(|c| c.info());
        let search = Search::new(sid, target, kind, purpose, self.info.id, seeds);
        trace!(search = sid.0, %target, ?kind, seeds = search.candidates().count(), "lookup started");
        self.searches.insert(sid, search);
        self.drive_search(ctx, sid);
        sid
    }

    /// Fill free request slots, then finish the search if it converged.
    fn drive_search(&mut self, ctx: &mut Ctx<'_>, sid: SearchId) {
        let (alpha, k) = (self.config.alpha, self.config.k);
        let Some(search) = self.searches.get_mut(&sid) else {
            return;
        };
        if !search.found_value() {
            let picks = search.next_to_query(alpha, k);
            let (target, kind) = (search.target, search.kind);
            for peer in picks {
                let rpc_id = self.send_request(ctx, peer.addr, Some(peer.id), RpcPurpose::Find(sid), |header| {
                    match kind {
                        SearchKind::FindNode => Message::FindNodeRequest(FindNodeRequest { header, target }),
                        SearchKind::FindValue => {
                            Message::FindValueRequest(FindValueRequest { header, key: target })
                        }
                    }
                });
                if let Some(search) = self.searches.get_mut(&sid) {
                    search.set_rpc(&peer.id, rpc_id);
                }
            }
        }

        if self.searches.get(&sid).is_some_and(|s| s.is_finished(k)) {
            self.finish_search(ctx, sid);
        }
    }

    fn on_find_reply(&mut self, ctx: &mut Ctx<'_>, sid: SearchId, candidate: &NodeId, reply: Reply) {
        let Some(search) = self.searches.get_mut(&sid) else {
            return;
        };
        match reply {
            Reply::Values { values, .. } if !values.is_empty() && search.kind == SearchKind::FindValue => {
                search.on_values(candidate, values);
            }
            Reply::Values { nodes, .. } | Reply::Nodes(nodes) => {
                search.on_response(candidate, nodes);
            }
            Reply::Ack => {
                search.on_response(candidate, []);
            }
        }
        self.drive_search(ctx, sid);
    }

    fn finish_search(&mut self, ctx: &mut Ctx<'_>, sid: SearchId) {
        let Some(mut search) = self.searches.remove(&sid) else {
            return;
        };
        for rpc_id in search.pending_rpcs() {
            if let Some(record) = self.pending.remove(&rpc_id) {
                ctx.scheduler.cancel_all(record.owner);
            }
        }

        let k = self.config.k;
        let values = search.take_values();
        let results = search.results(k);
        let success = !values.is_empty() || !results.is_empty();
        self.stats.record_lookup(search.requests_sent(), success);
        debug!(
            node = %self.info.id,
            search = sid.0,
            target = %search.target,
            requests = search.requests_sent(),
            results = results.len(),
            found = !values.is_empty(),
            "lookup finished"
        );

        if self.config.downlist {
            let down = search.down();
            if !down.is_empty() {
                for peer in search.up() {
                    self.send_request(ctx, peer.addr, Some(peer.id), RpcPurpose::Downlist, |header| {
                        Message::DownlistRequest(DownlistRequest {
                            header,
                            nodes: down.clone(),
                        })
                    });
                }
            }
        }

        match search.purpose {
            SearchPurpose::User(op) => {
                let status = match search.kind {
                    SearchKind::FindNode if !results.is_empty() => Status::Success,
                    SearchKind::FindValue if !values.is_empty() => Status::Success,
                    _ => Status::Failed,
                };
                self.emit_search_result(op, search.kind, search.target, status, results, values);
            }
            SearchPurpose::Store { op, key, value, ttl } => {
                self.start_store_fanout(ctx, op, key, value, ttl, results);
            }
            SearchPurpose::Join(_) => self.join_lookup_done(ctx, !results.is_empty()),
            SearchPurpose::Refresh => {}
        }
    }

    fn emit_search_result(
        &mut self,
        op: OpId,
        kind: SearchKind,
        target: NodeId,
        status: Status,
        nodes: Vec<NodeInfo>,
        values: Vec<Vec<u8>>,
    ) {
        let event = match kind {
            SearchKind::FindNode => NodeEvent::FindNode {
                op,
                target,
                status,
                nodes,
            },
            SearchKind::FindValue => NodeEvent::FindValue {
                op,
                key: target,
                status,
                values,
            },
        };
        self.emit(event);
    }

    // ── store ───────────────────────────────────────────────────────────────

    fn start_store_fanout(
        &mut self,
        ctx: &mut Ctx<'_>,
        op: Option<OpId>,
        key: NodeId,
        value: Vec<u8>,
        ttl: u64,
        targets: Vec<NodeInfo>,
    ) {
        if targets.is_empty() {
            self.finish_store(op, key, Status::Failed, 0);
            return;
        }
        let store_op = self.next_store_op;
        self.next_store_op += 1;
        self.store_ops.insert(
            store_op,
            StoreOp {
                op,
                key,
                value: value.clone(),
                outstanding: targets.len(),
                acked: Vec::new(),
            },
        );
        for peer in targets {
            self.send_request(ctx, peer.addr, Some(peer.id), RpcPurpose::Store(store_op), |header| {
                Message::StoreRequest(StoreRequest {
                    header,
                    key,
                    value: value.clone(),
                    ttl,
                })
            });
        }
    }

    fn store_acked(&mut self, store_op: u64, by: Option<NodeId>) {
        let Some(entry) = self.store_ops.get_mut(&store_op) else {
            return;
        };
        entry.outstanding = entry.outstanding.saturating_sub(1);
        if let Some(id) = by {
            entry.acked.push(id);
        }
        if entry.outstanding > 0 {
            return;
        }
        let Some(done) = self.store_ops.remove(&store_op) else {
            return;
        };

        let farthest = done.acked.iter().map(|id| done.key.distance(id)).max();
        let status = match farthest {
            Some(distance) => {
                self.store.set_max_distance(&done.key, &done.value, distance);
                Status::Success
            }
            None => Status::Failed,
        };
        debug!(node = %self.info.id, key = %done.key, replicas = done.acked.len(), ?status, "store finished");
        self.finish_store(done.op, done.key, status, done.acked.len());
    }

    fn finish_store(&mut self, op: Option<OpId>, key: NodeId, status: Status, replicas: usize) {
        match status {
            Status::Success => self.stats.stores_completed += 1,
            _ => self.stats.stores_failed += 1,
        }
        if let Some(op) = op {
            self.emit(NodeEvent::Store {
                op,
                key,
                status,
                replicas,
            });
        }
    }

    fn on_republish(&mut self, ctx: &mut Ctx<'_>, key: NodeId, value: Vec<u8>) {
        if self.store.get(&key, &value).is_none() {
            return;
        }
        match self.store.republish_item(ctx, &key, &value) {
            Some(ttl) => {
                trace!(node = %self.info.id, %key, ttl, "republishing item");
                self.stats.republished += 1;
                let purpose = SearchPurpose::Store {
                    op: None,
                    key,
                    value,
                    ttl,
                };
                self.start_search(ctx, key, SearchKind::FindNode, purpose);
            }
            None => self.stats.expired += 1,
        }
    }

    // ── join and maintenance ────────────────────────────────────────────────

    /// Keep up to `alpha` bootstrap pings in flight and move to the
    /// self-lookup once enough of them answered or the list ran dry.
    fn pump_join(&mut self, ctx: &mut Ctx<'_>) {
        let (alpha, k) = (self.config.alpha, self.config.k);
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if join.lookup_started {
            return;
        }

        let mut to_ping = Vec::new();
        if join.successes < k {
            while join.in_flight + to_ping.len() < alpha {
                match join.bootstrap.pop_front() {
                    Some(addr) => to_ping.push(addr),
                    None => break,
                }
            }
            join.in_flight += to_ping.len();
        }
        let start_lookup = join.successes >= k || (join.in_flight == 0 && join.successes > 0);
        let failed = join.in_flight == 0 && join.successes == 0;
        let op = join.op;
        if start_lookup {
            join.lookup_started = true;
        }

        for addr in to_ping {
            self.send_request(ctx, addr, None, RpcPurpose::JoinPing, |header| {
                Message::PingRequest(PingRequest { header })
            });
        }

        if start_lookup {
            let own = self.info.id;
            self.start_search(ctx, own, SearchKind::FindNode, SearchPurpose::Join(op));
        } else if failed {
            self.finish_join(Status::Failed);
        }
    }

    fn join_ping_done(&mut self, ctx: &mut Ctx<'_>, answered: bool) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        join.in_flight = join.in_flight.saturating_sub(1);
        if answered {
            join.successes += 1;
        }
        self.pump_join(ctx);
    }

    fn join_lookup_done(&mut self, ctx: &mut Ctx<'_>, found: bool) {
        if found {
            self.joined = true;
            self.finish_join(Status::Success);
            self.schedule_routing_check(ctx);
            return;
        }
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if !join.retried && !join.bootstrap.is_empty() {
            debug!(node = %self.info.id, remaining = join.bootstrap.len(), "join lookup failed, retrying");
            join.retried = true;
            join.lookup_started = false;
            join.successes = 0;
            self.pump_join(ctx);
        } else {
            self.finish_join(Status::Failed);
        }
    }

    fn finish_join(&mut self, status: Status) {
        let Some(join) = self.join.take() else {
            return;
        };
        info!(node = %self.info.id, ?status, contacts = self.routing.len(), "join finished");
        self.emit(NodeEvent::Join { op: join.op, status });
    }

    fn schedule_routing_check(&mut self, ctx: &mut Ctx<'_>) {
        let owner = match self.maintenance {
            Some(owner) => owner,
            None => {
                let owner = ctx.scheduler.new_owner();
                self.maintenance = Some(owner);
                owner
            }
        };
        ctx.scheduler.cancel_all(owner);
        ctx.scheduler.schedule_after(
            self.config.min_rt_check_time_interval,
            owner,
            Job::Node {
                addr: self.info.addr,
                task: NodeTask::RoutingCheck,
            },
        );
    }

    /// Refresh every bucket that saw no lookup for a full check interval.
    fn on_routing_check(&mut self, ctx: &mut Ctx<'_>) {
        let stale = self
            .routing
            .stale_buckets(ctx.now(), self.config.min_rt_check_time_interval);
        if !stale.is_empty() {
            trace!(node = %self.info.id, buckets = stale.len(), "refreshing stale buckets");
        }
        for (low, high) in stale {
            let target = NodeId::random_in_range(&mut *ctx.rng, &low, &high);
            self.start_search(ctx, target, SearchKind::FindNode, SearchPurpose::Refresh);
        }
        self.schedule_routing_check(ctx);
    }

    fn next_op(&mut self) -> OpId {
        let op = OpId(self.next_op);
        self.next_op += 1;
        op
    }

    fn emit(&mut self, event: NodeEvent) {
        self.events.push_back(event);
    }
}
