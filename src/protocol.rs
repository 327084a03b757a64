//! DHT protocol message definitions.
//!
//! Every RPC is a request/response pair. Each message carries a [`Header`]
//! with the sending and receiving addresses, the correlation id chosen by the
//! requester, and the sender's node id. The types are serialisable so a
//! transport may put them on a wire, but no wire format is prescribed.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::contact::NodeInfo;
use crate::id::NodeId;

/// Correlation id of an outstanding request. Wraps around.
pub type RpcId = u32;

/// Fields common to every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Address the message was sent from; responses go back here.
    pub from: SocketAddr,
    /// Destination address.
    pub to: SocketAddr,
    /// Chosen by the requester and echoed unchanged in the response.
    pub rpc_id: RpcId,
    /// Id of the node that sent this message.
    pub node_id: NodeId,
}

impl Header {
    /// Header for a response travelling back along `request`.
    pub fn reply(&self, responder: NodeId) -> Header {
        Header {
            from: self.to,
            to: self.from,
            rpc_id: self.rpc_id,
            node_id: responder,
        }
    }

    /// The sender as a routing-table entry candidate.
    pub fn sender(&self) -> NodeInfo {
        NodeInfo::new(self.node_id, self.from)
    }
}

/// Liveness probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub header: Header,
}

/// Proof of life; also refreshes the requester in the responder's table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub header: Header,
}

/// Store one value under a key for `ttl` milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub header: Header,
    pub key: NodeId,
    /// Opaque payload. Several values may live under one key.
    pub value: Vec<u8>,
    /// Remaining lifetime in milliseconds, measured from receipt.
    pub ttl: u64,
}

/// Acknowledges that the value was stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResponse {
    pub header: Header,
}

/// Ask for the contacts closest to `target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub header: Header,
    /// Id whose neighbourhood is wanted; need not belong to a node.
    pub target: NodeId,
}

/// Contacts the responder knows near the target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub header: Header,
    /// Up to `k` contacts closest to the target, requester excluded.
    pub nodes: Vec<NodeInfo>,
}

/// Ask for the values stored under `key`, or closer contacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub header: Header,
    /// Key whose values are wanted.
    pub key: NodeId,
}

/// Carries values when the responder holds any, otherwise closer contacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValueResponse {
    pub header: Header,
    /// Closer contacts. Empty when `values` is not.
    pub nodes: Vec<NodeInfo>,
    /// Every live value the responder holds under the key.
    pub values: Vec<Vec<u8>>,
}

/// Ids the sender found unresponsive during a lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlistRequest {
    pub header: Header,
    /// Peers that exhausted their retries during the sender's lookup.
    pub nodes: Vec<NodeId>,
}

/// Sent unconditionally; the receiver verifies the list on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlistResponse {
    pub header: Header,
}

/// RPC families, used for dispatch and per-kind counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcKind {
    Ping,
    Store,
    FindNode,
    FindValue,
    Downlist,
}

impl RpcKind {
    pub const ALL: [RpcKind; 5] = [
        RpcKind::Ping,
        RpcKind::Store,
        RpcKind::FindNode,
        RpcKind::FindValue,
        RpcKind::Downlist,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RpcKind::Ping => "ping",
            RpcKind::Store => "store",
            RpcKind::FindNode => "find_node",
            RpcKind::FindValue => "find_value",
            RpcKind::Downlist => "downlist",
        }
    }
}

/// Any message a node can send or receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    StoreRequest(StoreRequest),
    StoreResponse(StoreResponse),
    FindNodeRequest(FindNodeRequest),
    FindNodeResponse(FindNodeResponse),
    FindValueRequest(FindValueRequest),
    FindValueResponse(FindValueResponse),
    DownlistRequest(DownlistRequest),
    DownlistResponse(DownlistResponse),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::PingRequest(m) => &m.header,
            Message::PingResponse(m) => &m.header,
            Message::StoreRequest(m) => &m.header,
            Message::StoreResponse(m) => &m.header,
            Message::FindNodeRequest(m) => &m.header,
            Message::FindNodeResponse(m) => &m.header,
            Message::FindValueRequest(m) => &m.header,
            Message::FindValueResponse(m) => &m.header,
            Message::DownlistRequest(m) => &m.header,
            Message::DownlistResponse(m) => &m.header,
        }
    }

    pub fn from(&self) -> SocketAddr {
        self.header().from
    }

    pub fn to(&self) -> SocketAddr {
        self.header().to
    }

    pub fn rpc_id(&self) -> RpcId {
        self.header().rpc_id
    }

    pub fn kind(&self) -> RpcKind {
        match self {
            Message::PingRequest(_) | Message::PingResponse(_) => RpcKind::Ping,
            Message::StoreRequest(_) | Message::StoreResponse(_) => RpcKind::Store,
            Message::FindNodeRequest(_) | Message::FindNodeResponse(_) => RpcKind::FindNode,
            Message::FindValueRequest(_) | Message::FindValueResponse(_) => RpcKind::FindValue,
            Message::DownlistRequest(_) | Message::DownlistResponse(_) => RpcKind::Downlist,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::PingRequest(_)
                | Message::StoreRequest(_)
                | Message::FindNodeRequest(_)
                | Message::FindValueRequest(_)
                | Message::DownlistRequest(_)
        )
    }
}
