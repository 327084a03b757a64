//! Transport seam between a node and whatever carries its messages.
//!
//! The node only ever hands finished messages to a [`Transport`]; delivery is
//! fire-and-forget with no guarantee, so the node runs its own timeouts and
//! retries. Inbound messages reach the node through
//! [`crate::node::KadNode::handle_message`].

use std::collections::VecDeque;

use crate::protocol::{
    DownlistRequest, DownlistResponse, FindNodeRequest, FindNodeResponse, FindValueRequest,
    FindValueResponse, Message, PingRequest, PingResponse, StoreRequest, StoreResponse,
};

/// Outbound message sink.
///
/// Implementors provide [`Transport::send`]; the typed helpers wrap each
/// message in its [`Message`] variant.
pub trait Transport {
    fn send(&mut self, message: Message);

    fn send_ping_request(&mut self, msg: PingRequest) {
        self.send(Message::PingRequest(msg));
    }

    fn send_ping_response(&mut self, msg: PingResponse) {
        self.send(Message::PingResponse(msg));
    }

    fn send_store_request(&mut self, msg: StoreRequest) {
        self.send(Message::StoreRequest(msg));
    }

    fn send_store_response(&mut self, msg: StoreResponse) {
        self.send(Message::StoreResponse(msg));
    }

    fn send_find_node_request(&mut self, msg: FindNodeRequest) {
        self.send(Message::FindNodeRequest(msg));
    }

    fn send_find_node_response(&mut self, msg: FindNodeResponse) {
        self.send(Message::FindNodeResponse(msg));
    }

    fn send_find_value_request(&mut self, msg: FindValueRequest) {
        self.send(Message::FindValueRequest(msg));
    }

    fn send_find_value_response(&mut self, msg: FindValueResponse) {
        self.send(Message::FindValueResponse(msg));
    }

    fn send_downlist_request(&mut self, msg: DownlistRequest) {
        self.send(Message::DownlistRequest(msg));
    }

    fn send_downlist_response(&mut self, msg: DownlistResponse) {
        self.send(Message::DownlistResponse(msg));
    }
}

/// Transport that queues messages for an in-process driver to route.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    outbox: VecDeque<Message>,
    sent: u64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued message in send order.
    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.outbox.drain(..)
    }

    pub fn len(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    /// Total messages ever sent through this transport.
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: Message) {
        self.sent += 1;
        self.outbox.push_back(message);
    }
}
