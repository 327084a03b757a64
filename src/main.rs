//! Demo binary: simulate a small Kademlia network.
//!
//! Spins up `--nodes` simulated nodes on one scheduler, joins them through
//! the first one, stores `--values` values from random nodes, looks every
//! value up from another random node, and prints a JSON summary to stdout.
//!
//! # Usage
//!
//! ```bash
//! kad-dht --nodes 100 --values 50 --loss 0.05
//! RUST_LOG=kad_dht=debug kad-dht --realtime --settle-ms 3000
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kad_dht::{Config, LinkConfig, Network, NetworkHandle, NodeEvent, NodeId, Status, TelemetrySnapshot};

#[derive(Parser, Debug)]
#[command(name = "kad-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated nodes.
    #[arg(short, long, default_value_t = 50)]
    nodes: usize,

    /// Number of values to store and look up.
    #[arg(short, long, default_value_t = 20)]
    values: usize,

    /// TOML file with node settings.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Base one-way link delay in milliseconds.
    #[arg(long, default_value_t = 50)]
    delay: u64,

    /// Extra random delay in milliseconds.
    #[arg(long, default_value_t = 50)]
    jitter: u64,

    /// Probability that a message is dropped.
    #[arg(long, default_value_t = 0.1)]
    loss: f64,

    /// Run on the wall clock instead of the virtual one.
    #[arg(long)]
    realtime: bool,

    /// Wall-clock time given to each phase in realtime mode.
    #[arg(long, default_value_t = 5_000)]
    settle_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    success: usize,
    failed: usize,
    terminated: usize,
}

impl Tally {
    fn record(&mut self, status: Status) {
        match status {
            Status::Success => self.success += 1,
            Status::Failed => self.failed += 1,
            Status::Terminated => self.terminated += 1,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    nodes: usize,
    elapsed_ms: u64,
    joins: Tally,
    stores: Tally,
    lookups: Tally,
    /// Lookups that returned the value stored under their key.
    correct_values: usize,
    mean_requests_per_lookup: f64,
    routing_table_min: usize,
    routing_table_max: usize,
    messages_delivered: u64,
    messages_dropped: u64,
    seed_node: Option<TelemetrySnapshot>,
}

struct Workload {
    seed: SocketAddr,
    keys: Vec<(NodeId, Vec<u8>)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.validate().context("invalid node configuration")?;
    let link = LinkConfig {
        delay: args.delay,
        delay_jitter: args.jitter,
        packet_loss: args.loss,
    };
    link.validate().context("invalid link configuration")?;

    let summary = if args.realtime {
        run_realtime(&args, config, link).await?
    } else {
        run_virtual(&args, config, link)
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_virtual(args: &Args, config: Config, link: LinkConfig) -> Summary {
    let mut net = Network::new(args.seed, link);
    let workload = populate(&mut net, args, config);

    start_joins(&mut net, workload.seed);
    net.run_until_idle();
    info!(at = net.now(), "join phase settled");

    start_stores(&mut net, &workload);
    net.run_until_idle();
    info!(at = net.now(), "store phase settled");

    start_lookups(&mut net, &workload);
    net.run_until_idle();
    info!(at = net.now(), "lookup phase settled");

    summarize(&mut net, &workload)
}

async fn run_realtime(args: &Args, config: Config, link: LinkConfig) -> Result<Summary> {
    let mut net = Network::realtime(args.seed, link);
    let workload = populate(&mut net, args, config);
    let (handle, commands) = NetworkHandle::channel();
    let settle = Duration::from_millis(args.settle_ms);
    let (done_tx, done_rx) = oneshot::channel();

    let driver = tokio::spawn(async move {
        let seed = workload.seed;
        handle.post(move |net| start_joins(net, seed))?;
        time::sleep(settle).await;
        info!("join phase settled");

        let keys = workload.keys.clone();
        handle.post(move |net| start_stores(net, &Workload { seed, keys }))?;
        time::sleep(settle).await;
        info!("store phase settled");

        let keys = workload.keys.clone();
        handle.post(move |net| start_lookups(net, &Workload { seed, keys }))?;
        time::sleep(settle).await;
        info!("lookup phase settled");

        handle.post(move |net| {
            let summary = summarize(net, &workload);
            if done_tx.send(summary).is_err() {
                warn!("summary receiver dropped before the run finished");
            }
            net.stop();
        })?;
        anyhow::Ok(())
    });

    net.run_realtime(commands).await;
    driver.await.context("workload driver panicked")??;
    done_rx.await.context("network stopped before the summary was taken")
}

fn populate(net: &mut Network, args: &Args, config: Config) -> Workload {
    let mut seed = None;
    for _ in 0..args.nodes.max(1) {
        let id = NodeId::random(net.rng());
        let addr = net.add_node(id, config.clone());
        seed.get_or_insert(addr);
    }
    let keys = (0..args.values)
        .map(|i| {
            let key = NodeId::hash(format!("key-{i}").as_bytes());
            (key, format!("value-{i}").into_bytes())
        })
        .collect();
    Workload {
        seed: seed.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0))),
        keys,
    }
}

fn start_joins(net: &mut Network, seed: SocketAddr) {
    for addr in net.addrs() {
        if addr != seed {
            net.with_node(&addr, |node, ctx| node.join(ctx, [seed]));
        }
    }
}

fn start_stores(net: &mut Network, workload: &Workload) {
    let addrs = net.addrs();
    for (key, value) in &workload.keys {
        if let Some(addr) = addrs.choose(net.rng()).copied() {
            let value = value.clone();
            net.with_node(&addr, |node, ctx| node.store_default(ctx, *key, value));
        }
    }
}

fn start_lookups(net: &mut Network, workload: &Workload) {
    let addrs = net.addrs();
    for (key, _) in &workload.keys {
        if let Some(addr) = addrs.choose(net.rng()).copied() {
            net.with_node(&addr, |node, ctx| node.find_value(ctx, *key));
        }
    }
}

fn summarize(net: &mut Network, workload: &Workload) -> Summary {
    let mut summary = Summary {
        nodes: net.len(),
        elapsed_ms: net.now(),
        messages_delivered: net.delivered(),
        messages_dropped: net.dropped(),
        ..Summary::default()
    };

    for addr in net.addrs() {
        for event in net.take_events(&addr) {
            match event {
                NodeEvent::Join { status, .. } => summary.joins.record(status),
                NodeEvent::Store { status, .. } => summary.stores.record(status),
                NodeEvent::FindValue { key, status, values, .. } => {
                    summary.lookups.record(status);
                    let expected = workload.keys.iter().find(|(k, _)| *k == key).map(|(_, v)| v);
                    if expected.is_some_and(|v| values.contains(v)) {
                        summary.correct_values += 1;
                    }
                }
                NodeEvent::Ping { .. } | NodeEvent::FindNode { .. } => {}
            }
        }
    }

    let sizes: Vec<usize> = net.nodes().map(|n| n.routing_table().len()).collect();
    summary.routing_table_min = sizes.iter().copied().min().unwrap_or(0);
    summary.routing_table_max = sizes.iter().copied().max().unwrap_or(0);
    let lookups: u64 = net.nodes().map(|n| n.stats().lookups_finished()).sum();
    let requests: f64 = net
        .nodes()
        .map(|n| n.stats().mean_requests_per_lookup() * n.stats().lookups_finished() as f64)
        .sum();
    if lookups > 0 {
        summary.mean_requests_per_lookup = requests / lookups as f64;
    }
    summary.seed_node = net.node(&workload.seed).map(|n| n.telemetry(net.now()));
    summary
}
