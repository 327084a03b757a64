#[path = "common/mod.rs"]
mod common;

use std::net::SocketAddr;

use common::{mesh, single_event};
use kad_dht::{Config, Network, NodeId, Status};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

const NUM_NODES: usize = 128;
const K_PARAM: usize = 10;
const TOTAL_PUTS: usize = 512;
const PAYLOAD_LEN: usize = 64;

#[test]
fn data_distribution_is_relatively_even() {
    let config = Config::default().with_k(K_PARAM);
    let mut net = Network::new(0xfeed_face, common::lossless());
    let nodes: Vec<SocketAddr> = (0..NUM_NODES)
        .map(|_| {
            let id = NodeId::random(net.rng());
            net.add_node(id, config.clone())
        })
        .collect();
    mesh(&mut net, &nodes);

    let mut payload_rng = StdRng::seed_from_u64(0xdecaf_bad_c0ffee);
    let mut keys = Vec::with_capacity(TOTAL_PUTS);
    for _ in 0..TOTAL_PUTS {
        let origin = nodes[payload_rng.gen_range(0..NUM_NODES)];
        let mut payload = vec![0u8; PAYLOAD_LEN];
        payload_rng.fill_bytes(&mut payload);
        let key = NodeId::hash(&payload);
        keys.push(key);
        net.with_node(&origin, |node, ctx| node.store_default(ctx, key, payload));
        net.run_until_idle();
        assert_eq!(single_event(&mut net, &origin).status(), Status::Success);
    }

    let now = net.now();
    let per_node_counts: Vec<(usize, usize)> = nodes
        .iter()
        .enumerate()
        .map(|(idx, addr)| (idx, net.node(addr).map_or(0, |n| n.value_store().live_len(now))))
        .collect();

    let total_keys: usize = per_node_counts.iter().map(|(_, count)| *count).sum();
    let min = per_node_counts.iter().map(|(_, count)| *count).min().unwrap_or(0);
    let max = per_node_counts.iter().map(|(_, count)| *count).max().unwrap_or(0);
    let mean = total_keys as f64 / per_node_counts.len() as f64;
    let variance = per_node_counts
        .iter()
        .map(|(_, count)| {
            let diff = *count as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / per_node_counts.len() as f64;
    let stddev = variance.sqrt();

    println!("node_index,stored_keys");
    for (idx, count) in &per_node_counts {
        println!("{idx},{count}");
    }
    println!("summary,min,max,mean,stddev,total_keys");
    println!("summary,{min},{max},{mean:.2},{stddev:.2},{total_keys}");
    let coefficient_of_variation = stddev / mean.max(1.0);
    println!("summary_cv,{coefficient_of_variation:.4}");

    assert_eq!(total_keys, TOTAL_PUTS * K_PARAM, "every value lands on exactly k nodes");
    for key in &keys {
        let replicas = net.nodes().filter(|n| !n.value_store().get_items(now, key).is_empty()).count();
        assert_eq!(replicas, K_PARAM);
    }
    assert!(min > 0, "every node should store at least one key");
}
