//! Counters a node pushes as it works, and the snapshot it reports.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::RpcKind;

/// Sent/received counters per RPC family.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RpcCounts {
    pub requests_sent: BTreeMap<RpcKind, u64>,
    pub requests_received: BTreeMap<RpcKind, u64>,
    pub responses_received: BTreeMap<RpcKind, u64>,
    /// Requests resent after a timeout.
    pub retries: u64,
    /// Requests that exhausted their retry budget.
    pub timeouts: u64,
    /// Responses that matched no pending request.
    pub unmatched_responses: u64,
}

impl RpcCounts {
    pub fn sent(&self, kind: RpcKind) -> u64 {
        self.requests_sent.get(&kind).copied().unwrap_or(0)
    }

    pub fn received(&self, kind: RpcKind) -> u64 {
        self.requests_received.get(&kind).copied().unwrap_or(0)
    }
}

/// Running statistics of one node.
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub rpc: RpcCounts,
    /// Requests sent per finished lookup: `requests -> lookups`.
    pub requests_per_lookup: BTreeMap<usize, u64>,
    pub lookups_completed: u64,
    pub lookups_failed: u64,
    pub stores_completed: u64,
    pub stores_failed: u64,
    pub republished: u64,
    pub expired: u64,
}

impl NodeStats {
    pub fn record_sent(&mut self, kind: RpcKind) {
        *self.rpc.requests_sent.entry(kind).or_default() += 1;
    }

    pub fn record_request(&mut self, kind: RpcKind) {
        *self.rpc.requests_received.entry(kind).or_default() += 1;
    }

    pub fn record_response(&mut self, kind: RpcKind) {
        *self.rpc.responses_received.entry(kind).or_default() += 1;
    }

    pub fn record_lookup(&mut self, requests: usize, success: bool) {
        *self.requests_per_lookup.entry(requests).or_default() += 1;
        if success {
            self.lookups_completed += 1;
        } else {
            self.lookups_failed += 1;
        }
    }

    /// Lookups that ended, successfully or not.
    pub fn lookups_finished(&self) -> u64 {
        self.lookups_completed + self.lookups_failed
    }

    /// Mean requests per lookup, or 0 before any lookup finished.
    pub fn mean_requests_per_lookup(&self) -> f64 {
        let lookups: u64 = self.requests_per_lookup.values().sum();
        if lookups == 0 {
            return 0.0;
        }
        let requests: u64 = self
            .requests_per_lookup
            .iter()
            .map(|(reqs, n)| *reqs as u64 * n)
            .sum();
        requests as f64 / lookups as f64
    }
}

/// Point-in-time view of a node for telemetry and debugging.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Hex id of the node.
    pub node_id: String,
    pub joined: bool,
    /// Contacts across all buckets.
    pub routing_table_size: usize,
    pub bucket_count: usize,
    pub holder_bucket_size: usize,
    /// Live (key, value) items in the local store.
    pub stored_items: usize,
    /// Outstanding Ping/Store/Find/Downlist requests.
    pub pending_rpcs: usize,
    pub active_searches: usize,
    pub rpc: RpcCounts,
    pub requests_per_lookup: BTreeMap<usize, u64>,
    pub lookups_completed: u64,
    pub lookups_failed: u64,
    pub stores_completed: u64,
    pub stores_failed: u64,
    pub republished: u64,
    pub expired: u64,
}
