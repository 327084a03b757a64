//! In-process network of simulated nodes.
//!
//! [`Network`] owns one [`Scheduler`] shared by every node it hosts, the
//! address-to-node routing map, and a lossy link model. Messages sent by a
//! node land in a [`MemoryTransport`] outbox; after each node call the
//! network drains the outbox and schedules a [`Job::Deliver`] per message
//! after a random delay, unless the link drops it.
//!
//! All of it runs on the scheduler thread: adding, removing and delivering
//! are serialized with every node callback.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::{Config, LinkConfig};
use crate::id::NodeId;
use crate::net::MemoryTransport;
use crate::node::{Ctx, Job, KadNode, NodeEvent};
use crate::scheduler::{Owner, Scheduler, Timestamp};

/// Closure run against the network from the realtime loop.
pub type Command = Box<dyn FnOnce(&mut Network) + Send>;

/// Receiving end of the command channel consumed by [`Network::run_realtime`].
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Posts work into a network driven by [`Network::run_realtime`].
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl NetworkHandle {
    pub fn channel() -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `command`; it runs between two jobs on the scheduler thread.
    pub fn post<F>(&self, command: F) -> Result<()>
    where
        F: FnOnce(&mut Network) + Send + 'static,
    {
        self.tx
            .send(Box::new(command))
            .map_err(|_| anyhow!("network loop has shut down"))
    }
}

enum Wake {
    Due,
    Command(Command),
    Closed,
}

const FIRST_PORT: u16 = 10_000;

pub struct Network {
    scheduler: Scheduler<Job>,
    nodes: BTreeMap<SocketAddr, KadNode>,
    transport: MemoryTransport,
    rng: StdRng,
    link: LinkConfig,
    /// Addresses whose traffic is silently dropped in both directions.
    unreachable: HashSet<SocketAddr>,
    link_owner: Owner,
    in_flight: usize,
    delivered: u64,
    dropped: u64,
    next_port: u16,
}

impl Network {
    /// Network on a virtual clock.
    pub fn new(seed: u64, link: LinkConfig) -> Self {
        Self::with_scheduler(Scheduler::with_virtual_clock(), seed, link)
    }

    /// Network following tokio's clock; drive it with [`Network::run_realtime`].
    pub fn realtime(seed: u64, link: LinkConfig) -> Self {
        Self::with_scheduler(Scheduler::with_realtime_clock(), seed, link)
    }

    pub fn with_scheduler(mut scheduler: Scheduler<Job>, seed: u64, link: LinkConfig) -> Self {
        let link_owner = scheduler.new_owner();
        Self {
            scheduler,
            nodes: BTreeMap::new(),
            transport: MemoryTransport::new(),
            rng: StdRng::seed_from_u64(seed),
            link,
            unreachable: HashSet::new(),
            link_owner,
            in_flight: 0,
            delivered: 0,
            dropped: 0,
            next_port: FIRST_PORT,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.scheduler.now()
    }

    pub fn scheduler(&self) -> &Scheduler<Job> {
        &self.scheduler
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn set_link(&mut self, link: LinkConfig) {
        self.link = link;
    }

    /// Random source shared with the nodes, for picking ids and keys.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Host a node at the next free loopback address.
    pub fn add_node(&mut self, id: NodeId, config: Config) -> SocketAddr {
        loop {
            let addr = SocketAddr::from(([127, 0, 0, 1], self.next_port));
            self.next_port = self.next_port.wrapping_add(1);
            if !self.nodes.contains_key(&addr) {
                self.nodes.insert(addr, KadNode::new(id, addr, config));
                debug!(node = %id, %addr, "node added");
                return addr;
            }
        }
    }

    pub fn add_node_at(&mut self, addr: SocketAddr, id: NodeId, config: Config) -> Result<()> {
        if self.nodes.contains_key(&addr) {
            bail!("address {addr} already hosts a node");
        }
        self.nodes.insert(addr, KadNode::new(id, addr, config));
        debug!(node = %id, %addr, "node added");
        Ok(())
    }

    /// Terminate and unhost the node at `addr`. The returned node still holds
    /// its `Terminated` completions.
    pub fn remove_node(&mut self, addr: &SocketAddr) -> Option<KadNode> {
        let mut node = self.nodes.remove(addr)?;
        let mut ctx = Ctx::new(&mut self.scheduler, &mut self.transport, &mut self.rng);
        node.terminate(&mut ctx);
        self.flush();
        debug!(node = %node.id(), %addr, "node removed");
        Some(node)
    }

    pub fn node(&self, addr: &SocketAddr) -> Option<&KadNode> {
        self.nodes.get(addr)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &KadNode> {
        self.nodes.values()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Black-hole every message to or from `addr` while `down` is set.
    pub fn set_unreachable(&mut self, addr: SocketAddr, down: bool) {
        if down {
            self.unreachable.insert(addr);
        } else {
            self.unreachable.remove(&addr);
        }
    }

    /// Run `f` against the node at `addr`, then route whatever it sent.
    pub fn with_node<R, F>(&mut self, addr: &SocketAddr, f: F) -> Option<R>
    where
        F: FnOnce(&mut KadNode, &mut Ctx<'_>) -> R,
    {
        let node = self.nodes.get_mut(addr)?;
        let mut ctx = Ctx::new(&mut self.scheduler, &mut self.transport, &mut self.rng);
        let out = f(node, &mut ctx);
        self.flush();
        Some(out)
    }

    pub fn take_events(&mut self, addr: &SocketAddr) -> Vec<NodeEvent> {
        self.nodes
            .get_mut(addr)
            .map(KadNode::take_events)
            .unwrap_or_default()
    }

    /// Messages handed to a live node.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Messages lost to the link model, black holes or missing nodes.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// No message in flight and no node with work outstanding.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.nodes.values().all(KadNode::is_idle)
    }

    /// Run one job under the virtual clock. `false` once the queue is empty.
    pub fn step(&mut self) -> bool {
        match self.scheduler.advance() {
            Some(job) => {
                self.dispatch(job);
                true
            }
            None => false,
        }
    }

    /// Run until every operation settled. Periodic maintenance jobs stay
    /// queued.
    pub fn run_until_idle(&mut self) {
        while !self.is_idle() {
            if !self.step() {
                break;
            }
        }
    }

    pub fn run_for(&mut self, duration: u64) {
        let deadline = self.now().saturating_add(duration);
        self.run_until(deadline);
    }

    /// Run every job due by `deadline` and leave the virtual clock there.
    pub fn run_until(&mut self, deadline: Timestamp) {
        while let Some(job) = self.scheduler.advance_until(deadline) {
            self.dispatch(job);
        }
    }

    /// Stop a running [`Network::run_realtime`] loop.
    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    /// Drive the network on tokio's clock: run due jobs, sleep until the
    /// next one, and wake early for posted commands. Returns once stopped or
    /// once every [`NetworkHandle`] is dropped.
    pub async fn run_realtime(&mut self, mut commands: CommandReceiver) {
        self.scheduler.start();
        while self.scheduler.is_running() {
            while let Some(job) = self.scheduler.pop_due() {
                self.dispatch(job);
            }
            if !self.scheduler.is_running() {
                break;
            }
            let wake = tokio::select! {
                _ = self.scheduler.sleep_until_due() => Wake::Due,
                command = commands.recv() => command.map_or(Wake::Closed, Wake::Command),
            };
            match wake {
                Wake::Due => {}
                Wake::Command(command) => command(self),
                Wake::Closed => break,
            }
        }
        self.scheduler.stop();
    }

    fn dispatch(&mut self, job: Job) {
        match job {
            Job::Deliver(message) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let to = message.to();
                let Some(node) = self.nodes.get_mut(&to) else {
                    trace!(%to, kind = message.kind().as_str(), "no node at destination");
                    self.dropped += 1;
                    return;
                };
                self.delivered += 1;
                let mut ctx = Ctx::new(&mut self.scheduler, &mut self.transport, &mut self.rng);
                node.handle_message(&mut ctx, message);
            }
            Job::Node { addr, task } => {
                let Some(node) = self.nodes.get_mut(&addr) else {
                    return;
                };
                let mut ctx = Ctx::new(&mut self.scheduler, &mut self.transport, &mut self.rng);
                node.handle_task(&mut ctx, task);
            }
        }
        self.flush();
    }

    /// Put every queued outbound message on the wire.
    fn flush(&mut self) {
        let outbox: Vec<_> = self.transport.drain().collect();
        for message in outbox {
            let (from, to) = (message.from(), message.to());
            if self.unreachable.contains(&to) || self.unreachable.contains(&from) {
                trace!(%from, %to, "unreachable, dropping");
                self.dropped += 1;
                continue;
            }
            if self.link.packet_loss > 0.0 && self.rng.gen::<f64>() < self.link.packet_loss {
                trace!(%from, %to, rpc_id = message.rpc_id(), "packet lost");
                self.dropped += 1;
                continue;
            }
            let jitter = match self.link.delay_jitter {
                0 => 0,
                max => self.rng.gen_range(0..=max),
            };
            self.scheduler
                .schedule_after(self.link.delay + jitter, self.link_owner, Job::Deliver(message));
            self.in_flight += 1;
        }
    }
}
