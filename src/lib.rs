//! # kad-dht
//!
//! A Kademlia distributed hash table node runtime. Every node keeps a
//! routing table of k-buckets ordered by XOR distance, answers and issues the
//! PING, STORE, FIND_NODE and FIND_VALUE RPCs, and keeps stored values alive
//! by republishing them as the network churns.
//!
//! All asynchronous behaviour runs on a deterministic single-threaded job
//! queue, so the same code drives a virtual-clock simulation and a node on
//! tokio's clock.
//!
//! The crate is split into modules that build on each other:
//!
//! - [`id`]: 160-bit identifiers and the XOR metric.
//! - [`scheduler`]: the time-ordered job queue with owner-based cancellation.
//! - [`kbucket`] and [`routing`]: contact buckets and the routing table that
//!   splits only around the local node's own id.
//! - [`store`]: the local value store with expiry and randomized republish.
//! - [`lookup`]: the iterative, `alpha`-parallel search state machine.
//! - [`node`]: [`KadNode`], which ties everything together behind the
//!   [`Transport`] seam.
//! - [`sim`]: an in-process [`Network`] that hosts many nodes on one scheduler.
//!
//! ## Getting started
//!
//! ```
//! use kad_dht::{Config, LinkConfig, Network, NodeEvent, NodeId, Status};
//!
//! let mut net = Network::new(7, LinkConfig::instant());
//! let seed = net.add_node(NodeId::from_u64(1), Config::default());
//! let peer = net.add_node(NodeId::from_u64(2), Config::default());
//!
//! net.with_node(&peer, |node, ctx| node.join(ctx, [seed]));
//! net.run_until_idle();
//!
//! let events = net.take_events(&peer);
//! assert!(matches!(events[..], [NodeEvent::Join { status: Status::Success, .. }]));
//! ```

pub mod config;
pub mod contact;
pub mod id;
pub mod kbucket;
pub mod lookup;
pub mod net;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod scheduler;
pub mod sim;
pub mod stats;
pub mod store;

pub use config::{Config, LinkConfig};
pub use contact::{Contact, NodeInfo};
pub use id::{NodeId, ID_BITS, ID_BYTES};
pub use kbucket::{AddOutcome, KBucket};
pub use net::{MemoryTransport, Transport};
pub use node::{Ctx, Job, KadNode, NodeEvent, NodeTask, OpId, Status};
pub use protocol::{Message, RpcId, RpcKind};
pub use routing::RoutingTable;
pub use scheduler::{Clock, Owner, Scheduler, Timestamp};
pub use sim::{Network, NetworkHandle};
pub use stats::TelemetrySnapshot;
pub use store::ValueStore;
