#[path = "common/mod.rs"]
mod common;

use std::collections::HashSet;
use std::net::SocketAddr;

use common::{info_of, mesh, perfect_closest};
use kad_dht::{Config, Network, NodeEvent, NodeId, OpId, Status};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;

const NODE_COUNT: u32 = 256;
const K_PARAM: usize = 20;
const ALPHA_PARAM: usize = 3;
const TARGET_SAMPLES: usize = 64;
const ORIGINS_PER_TARGET: usize = 4;
const HISTOGRAM_BUCKETS: usize = 10;

#[derive(Debug, Serialize, Clone)]
struct SampleRow {
    origin_index: usize,
    target_index: usize,
    overlap_fraction: f64,
    closest_present: bool,
}

struct QuerySpec {
    origin_index: usize,
    target_index: usize,
    target: NodeId,
    perfect_ids: Vec<NodeId>,
    op: Option<OpId>,
}

#[derive(Serialize)]
struct HistogramBucket {
    bucket_start: f64,
    bucket_end: f64,
    count: usize,
}

#[derive(Serialize)]
struct AggregateReport {
    node_count: u32,
    target_samples: usize,
    origins_per_target: usize,
    mean_overlap_fraction: f64,
    median_overlap_fraction: f64,
    mean_requests_per_lookup: f64,
    histogram: Vec<HistogramBucket>,
    sample_count: usize,
}

#[test]
fn iterative_find_node_quality_report() {
    let config = Config::default().with_k(K_PARAM).with_alpha(ALPHA_PARAM);
    let mut net = Network::new(0, common::lossless());
    let nodes: Vec<SocketAddr> = (0..NODE_COUNT)
        .map(|_| {
            let id = NodeId::random(net.rng());
            net.add_node(id, config.clone())
        })
        .collect();
    mesh(&mut net, &nodes);
    let node_ids: Vec<NodeId> = nodes.iter().map(|a| info_of(&net, a).id).collect();

    let mut rng = StdRng::seed_from_u64(0);
    let mut queries = build_queries(&mut rng, &node_ids);
    for query in &mut queries {
        let target = query.target;
        query.op = net.with_node(&nodes[query.origin_index], |node, ctx| node.find_node(ctx, target));
    }
    net.run_until_idle();

    let mut results = Vec::new();
    for addr in &nodes {
        results.extend(net.take_events(addr).into_iter().map(|e| (*addr, e)));
    }

    let mut samples = Vec::with_capacity(queries.len());
    for query in &queries {
        let origin: SocketAddr = nodes[query.origin_index];
        let found = results.iter().find_map(|(addr, event)| match event {
            NodeEvent::FindNode { op, status, nodes: closest, .. }
                if *addr == origin && Some(*op) == query.op =>
            {
                assert_eq!(*status, Status::Success);
                Some(closest)
            }
            _ => None,
        });
        let found = found.expect("every lookup completes");
        let result_ids: HashSet<NodeId> = found.iter().map(|c| c.id).collect();
        let overlap = query.perfect_ids.iter().filter(|id| result_ids.contains(*id)).count();
        samples.push(SampleRow {
            origin_index: query.origin_index,
            target_index: query.target_index,
            overlap_fraction: overlap as f64 / query.perfect_ids.len() as f64,
            closest_present: query.perfect_ids.first().is_some_and(|best| result_ids.contains(best)),
        });
    }

    let overlaps: Vec<f64> = samples.iter().map(|row| row.overlap_fraction).collect();
    let mean_overlap = overlaps.iter().sum::<f64>() / overlaps.len() as f64;
    let median_overlap = {
        let mut sorted = overlaps.clone();
        sorted.sort_by(f64::total_cmp);
        if sorted.len() % 2 == 1 {
            sorted[sorted.len() / 2]
        } else {
            let upper = sorted.len() / 2;
            (sorted[upper - 1] + sorted[upper]) / 2.0
        }
    };
    let lookups: u64 = net.nodes().map(|n| n.stats().lookups_finished()).sum();
    let requests: f64 = net
        .nodes()
        .map(|n| n.stats().mean_requests_per_lookup() * n.stats().lookups_finished() as f64)
        .sum();

    let report = AggregateReport {
        node_count: NODE_COUNT,
        target_samples: TARGET_SAMPLES,
        origins_per_target: ORIGINS_PER_TARGET,
        mean_overlap_fraction: mean_overlap,
        median_overlap_fraction: median_overlap,
        mean_requests_per_lookup: requests / lookups.max(1) as f64,
        histogram: build_histogram(&overlaps),
        sample_count: samples.len(),
    };
    println!("{}", serde_json::to_string_pretty(&report).expect("serialize report"));

    println!("origin_index,target_index,overlap_fraction,closest_present");
    for row in &samples {
        println!(
            "{},{},{:.6},{}",
            row.origin_index, row.target_index, row.overlap_fraction, row.closest_present
        );
    }

    let hit_rate = samples.iter().filter(|row| row.closest_present).count() as f64 / samples.len() as f64;
    assert!(hit_rate >= 0.98, "closest node missing from {:.1}% of results", (1.0 - hit_rate) * 100.0);
    assert!(mean_overlap >= 0.9, "mean overlap {mean_overlap:.3}");
}

fn build_queries(rng: &mut StdRng, node_ids: &[NodeId]) -> Vec<QuerySpec> {
    let mut queries = Vec::with_capacity(TARGET_SAMPLES * ORIGINS_PER_TARGET);
    for target_index in 0..TARGET_SAMPLES {
        let target = NodeId::random(rng);
        for _ in 0..ORIGINS_PER_TARGET {
            let origin_index = rng.gen_range(0..node_ids.len());
            let others: Vec<NodeId> = node_ids
                .iter()
                .copied()
                .filter(|id| *id != node_ids[origin_index])
                .collect();
            queries.push(QuerySpec {
                origin_index,
                target_index,
                target,
                perfect_ids: perfect_closest(&others, &target, K_PARAM),
                op: None,
            });
        }
    }
    queries
}

fn build_histogram(samples: &[f64]) -> Vec<HistogramBucket> {
    let mut buckets = vec![0usize; HISTOGRAM_BUCKETS];
    for &value in samples {
        let index = ((value * HISTOGRAM_BUCKETS as f64).floor() as usize).min(HISTOGRAM_BUCKETS - 1);
        buckets[index] += 1;
    }

    let bucket_width = 1.0 / HISTOGRAM_BUCKETS as f64;
    buckets
        .into_iter()
        .enumerate()
        .map(|(index, count)| HistogramBucket {
            bucket_start: index as f64 * bucket_width,
            bucket_end: if index == HISTOGRAM_BUCKETS - 1 {
                1.0
            } else {
                (index + 1) as f64 * bucket_width
            },
            count,
        })
        .collect()
}
