#![allow(dead_code)]

use std::net::SocketAddr;

use kad_dht::{Config, KadNode, LinkConfig, Network, NodeEvent, NodeId, NodeInfo, Status};

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 20];
    id[..4].copy_from_slice(&index.to_be_bytes());
    NodeId::from_bytes(id)
}

/// A network of `count` nodes with ids from [`make_node_id`], starting at `first`.
pub fn spawn_nodes(net: &mut Network, first: u32, count: u32, config: &Config) -> Vec<SocketAddr> {
    (first..first + count)
        .map(|index| net.add_node(make_node_id(index), config.clone()))
        .collect()
}

pub fn info_of(net: &Network, addr: &SocketAddr) -> NodeInfo {
    net.node(addr).map(KadNode::info).expect("node is hosted")
}

/// Let every node in `addrs` know about every other one without any traffic.
pub fn mesh(net: &mut Network, addrs: &[SocketAddr]) {
    let infos: Vec<NodeInfo> = addrs.iter().map(|a| info_of(net, a)).collect();
    for addr in addrs {
        for info in &infos {
            if info.addr != *addr {
                net.with_node(addr, |node, ctx| node.add_contact(ctx, *info));
            }
        }
    }
}

/// Join every node after the first through the first, one at a time.
pub fn join_all(net: &mut Network, addrs: &[SocketAddr]) {
    let seed = addrs[0];
    for addr in &addrs[1..] {
        net.with_node(addr, |node, ctx| node.join(ctx, [seed]));
        net.run_until_idle();
        let events = net.take_events(addr);
        assert!(
            matches!(events[..], [NodeEvent::Join { status: Status::Success, .. }]),
            "join of {addr} failed: {events:?}"
        );
    }
}

/// The one completion `addr` produced since the last call.
pub fn single_event(net: &mut Network, addr: &SocketAddr) -> NodeEvent {
    let mut events = net.take_events(addr);
    assert_eq!(events.len(), 1, "expected one event, got {events:?}");
    events.remove(0)
}

pub fn lossless() -> LinkConfig {
    LinkConfig::fixed(10)
}

/// Ids of `all` sorted by distance to `target`, truncated to `count`.
pub fn perfect_closest(all: &[NodeId], target: &NodeId, count: usize) -> Vec<NodeId> {
    let mut sorted = all.to_vec();
    sorted.sort_by(|a, b| target.cmp_distance(a, b));
    sorted.truncate(count);
    sorted
}
