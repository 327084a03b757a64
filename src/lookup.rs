//! State of one iterative FIND_NODE / FIND_VALUE search.
//!
//! A [`Search`] is pure bookkeeping: it decides whom to ask next and when the
//! search has converged, while the node does the sending, the timeouts and
//! the completion reporting. Candidates are copies of routing-table contacts,
//! keyed by their XOR distance to the target, so iteration order is always
//! closest first.

use std::collections::BTreeMap;

use crate::contact::NodeInfo;
use crate::id::NodeId;
use crate::node::OpId;
use crate::protocol::RpcId;

/// Handle of a search in the node's search table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchId(pub(crate) u64);

/// Which RPC the search issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchKind {
    FindNode,
    FindValue,
}

/// What happens with the result once the search finishes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchPurpose {
    /// A caller asked for it; report through a node event.
    User(OpId),
    /// First phase of a store: fan the value out to the result set.
    /// `op` is `None` for republishes.
    Store {
        op: Option<OpId>,
        key: NodeId,
        value: Vec<u8>,
        ttl: u64,
    },
    /// Self-lookup that completes a join.
    Join(OpId),
    /// Routing-table refresh of a stale bucket.
    Refresh,
}

/// Lifecycle of a candidate within one search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateState {
    Unknown,
    Pending,
    Down,
    Up,
}

#[derive(Clone, Debug)]
pub struct Candidate {
    pub info: NodeInfo,
    pub state: CandidateState,
    /// Correlation id of the in-flight request while `Pending`.
    pub rpc_id: Option<RpcId>,
}

#[derive(Debug)]
pub struct Search {
    pub id: SearchId,
    pub target: NodeId,
    pub kind: SearchKind,
    pub purpose: SearchPurpose,
    self_id: NodeId,
    candidates: BTreeMap<NodeId, Candidate>,
    pending: usize,
    requests_sent: usize,
    /// Values collected by a FIND_VALUE search.
    values: Vec<Vec<u8>>,
}

impl Search {
    pub fn new(
        id: SearchId,
        target: NodeId,
        kind: SearchKind,
        purpose: SearchPurpose,
        self_id: NodeId,
        seeds: impl IntoIterator<Item = NodeInfo>,
    ) -> Self {
        let mut search = Self {
            id,
            target,
            kind,
            purpose,
            self_id,
            candidates: BTreeMap::new(),
            pending: 0,
            requests_sent: 0,
            values: Vec::new(),
        };
        search.merge(seeds);
        search
    }

    /// Add newly learned contacts. Known ids and the searcher itself are
    /// skipped.
    pub fn merge(&mut self, nodes: impl IntoIterator<Item = NodeInfo>) -> usize {
        let mut added = 0;
        for info in nodes {
            if info.id == self.self_id {
                continue;
            }
            let distance = self.target.distance(&info.id);
            self.candidates.entry(distance).or_insert_with(|| {
                added += 1;
                Candidate {
                    info,
                    state: CandidateState::Unknown,
                    rpc_id: None,
                }
            });
        }
        added
    }

    /// Pick `Unknown` candidates among the `k` closest live ones until
    /// `alpha` requests are pending. The picked candidates become `Pending`.
    pub fn next_to_query(&mut self, alpha: usize, k: usize) -> Vec<NodeInfo> {
        let mut picked = Vec::new();
        if self.pending >= alpha {
            return picked;
        }
        for candidate in self
            .candidates
            .values_mut()
            .filter(|c| c.state != CandidateState::Down)
            .take(k)
        {
            if self.pending >= alpha {
                break;
            }
            if candidate.state == CandidateState::Unknown {
                candidate.state = CandidateState::Pending;
                self.pending += 1;
                self.requests_sent += 1;
                picked.push(candidate.info);
            }
        }
        picked
    }

    pub fn set_rpc(&mut self, id: &NodeId, rpc_id: RpcId) {
        if let Some(candidate) = self.candidate_mut(id) {
            candidate.rpc_id = Some(rpc_id);
        }
    }

    /// A pending candidate answered with `nodes`. Answers from candidates
    /// that are not pending are dropped.
    pub fn on_response(&mut self, id: &NodeId, nodes: impl IntoIterator<Item = NodeInfo>) -> usize {
        if !self.settle(id, CandidateState::Up) {
            return 0;
        }
        self.merge(nodes)
    }

    /// A pending candidate answered with values.
    pub fn on_values(&mut self, id: &NodeId, values: Vec<Vec<u8>>) {
        if !self.settle(id, CandidateState::Up) {
            return;
        }
        for value in values {
            if !self.values.contains(&value) {
                self.values.push(value);
            }
        }
    }

    /// A pending candidate exhausted its retries.
    pub fn on_failure(&mut self, id: &NodeId) {
        self.settle(id, CandidateState::Down);
    }

    /// Converged: nothing pending and no `Unknown` among the `k` closest
    /// live candidates, or a value was found.
    pub fn is_finished(&self, k: usize) -> bool {
        if self.found_value() {
            return true;
        }
        self.pending == 0
            && !self
                .candidates
                .values()
                .filter(|c| c.state != CandidateState::Down)
                .take(k)
                .any(|c| c.state == CandidateState::Unknown)
    }

    pub fn found_value(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn take_values(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.values)
    }

    /// The `k` closest candidates that answered.
    pub fn results(&self, k: usize) -> Vec<NodeInfo> {
        self.with_state(CandidateState::Up).take(k).map(|c| c.info).collect()
    }

    pub fn up(&self) -> Vec<NodeInfo> {
        self.with_state(CandidateState::Up).map(|c| c.info).collect()
    }

    pub fn down(&self) -> Vec<NodeId> {
        self.with_state(CandidateState::Down).map(|c| c.info.id).collect()
    }

    /// Correlation ids of requests still in flight.
    pub fn pending_rpcs(&self) -> Vec<RpcId> {
        self.with_state(CandidateState::Pending)
            .filter_map(|c| c.rpc_id)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    pub fn candidate(&self, id: &NodeId) -> Option<&Candidate> {
        self.candidates.get(&self.target.distance(id))
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    fn with_state(&self, state: CandidateState) -> impl Iterator<Item = &Candidate> {
        self.candidates.values().filter(move |c| c.state == state)
    }

    fn candidate_mut(&mut self, id: &NodeId) -> Option<&mut Candidate> {
        let distance = self.target.distance(id);
        self.candidates.get_mut(&distance)
    }

    /// Move a `Pending` candidate to `state`. Returns false for any other
    /// candidate, whose answer is stale.
    fn settle(&mut self, id: &NodeId, state: CandidateState) -> bool {
        let Some(candidate) = self.candidate_mut(id) else {
            return false;
        };
        if candidate.state != CandidateState::Pending {
            return false;
        }
        candidate.state = state;
        candidate.rpc_id = None;
        self.pending -= 1;
        true
    }
}
