//! Peer records.
//!
//! [`NodeInfo`] is what travels inside RPCs (identity plus address);
//! [`Contact`] is what the routing table owns (the same fields plus the last
//! time the peer was heard from).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::id::NodeId;
use crate::scheduler::Timestamp;

/// Identity and address of a peer as carried by the wire messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// A routing-table entry.
///
/// Owned by exactly one k-bucket. Lookups copy the [`NodeInfo`] part into
/// their own candidate records rather than aliasing this one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Virtual or wall-clock milliseconds at which the peer was last heard from.
    pub last_seen: Timestamp,
}

impl Contact {
    pub fn new(info: NodeInfo, last_seen: Timestamp) -> Self {
        Self {
            id: info.id,
            addr: info.addr,
            last_seen,
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            addr: self.addr,
        }
    }
}

impl From<Contact> for NodeInfo {
    fn from(contact: Contact) -> Self {
        contact.info()
    }
}
