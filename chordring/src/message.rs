//! Route message envelopes and the reuse pool.
//!
//! Every exchange between nodes travels in a [`RouteMessage`] envelope.
//! Envelopes are pooled: the driver and the nodes move `Box<RouteMessage>`
//! values between queues and hand consumed envelopes back to the
//! [`MessagePool`]. Because release takes the box by value, a released
//! envelope cannot be touched again by its former owner; the dangling-reuse
//! hazard of a manual free list is ruled out by ownership transfer.

use serde::{Deserialize, Serialize};

use crate::handle::NodeHandle;
use crate::id::RingId;

/// Protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Find the successor of a key (join handshake).
    FindSucc,
    /// Find the node preceding a key; the answer is the key's successor.
    FindPre,
    /// Ask a node for its predecessor pointer.
    GetPre,
    /// Overwrite the successor pointer (graceful leave).
    SetSucc,
    /// Overwrite the predecessor pointer (graceful leave).
    SetPre,
    /// Offer this node as a predecessor candidate (stabilize).
    Notify,
    /// Request or carry a successor list.
    SuccList,
    /// Application broadcast fanning out along finger gaps.
    Broadcast,
    /// Application data routed toward a key.
    Data,
}

/// Message modes. A request expects a correlated reply; a refresh is
/// fire-and-forget; an error is synthesized by the driver when the
/// addressee no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageMode {
    Request,
    Reply,
    Refresh,
    Error,
}

/// Envelope payloads. The engine interprets only the routing-control
/// variants; application bytes stay opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    None,
    /// The key a lookup asks about.
    Key(RingId),
    /// A single handle answer (predecessor/successor), possibly unknown.
    Handle(Option<NodeHandle>),
    /// A successor list.
    Handles(Vec<NodeHandle>),
    /// Broadcast data plus the limit id bounding this fan-out branch.
    Broadcast { limit: RingId, data: Vec<u8> },
    /// Application data routed toward the destination key.
    Data(Vec<u8>),
}

/// A routed protocol envelope.
///
/// `destination` names the logical target (for [`MessageKind::Data`] it is a
/// virtual handle wrapping the destination *key*); `next_hop` names the node
/// the driver actually delivers to. The correlation key links a request to
/// its eventual reply; refreshes carry none.
#[derive(Debug, Clone)]
pub struct RouteMessage {
    pub source: NodeHandle,
    pub destination: NodeHandle,
    pub next_hop: NodeHandle,
    pub kind: MessageKind,
    pub mode: MessageMode,
    pub correlation: Option<String>,
    /// Identifies the application stream the payload belongs to.
    pub app_id: u32,
    /// Hop counter for routing diagnostics.
    pub hops: u32,
    pub payload: Payload,
}

impl RouteMessage {
    fn blank() -> Self {
        let nil = NodeHandle::new(RingId::zero(32));
        Self {
            source: nil,
            destination: nil,
            next_hop: nil,
            kind: MessageKind::Data,
            mode: MessageMode::Refresh,
            correlation: None,
            app_id: 0,
            hops: 0,
            payload: Payload::None,
        }
    }

    /// Reset all fields for reuse, keeping allocated capacity where possible.
    fn clear(&mut self) {
        *self = Self::blank();
    }

    /// True for application traffic (DATA and BROADCAST).
    pub fn is_app(&self) -> bool {
        matches!(self.kind, MessageKind::Data | MessageKind::Broadcast)
    }

    /// Turn this envelope into a reply to its own sender, in place.
    ///
    /// Endpoints are swapped, the mode becomes [`MessageMode::Reply`] and
    /// the correlation key is preserved so the requester's continuation
    /// fires.
    pub fn into_reply(&mut self, from: NodeHandle, payload: Payload) {
        self.destination = self.source;
        self.next_hop = self.source;
        self.source = from;
        self.mode = MessageMode::Reply;
        self.payload = payload;
    }
}

/// Free list of route message envelopes.
///
/// Single-threaded by construction; acquire and release may interleave in
/// any order within the one simulation thread.
#[derive(Debug, Default)]
pub struct MessagePool {
    free: Vec<Box<RouteMessage>>,
    allocated: u64,
    reused: u64,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a blank envelope, reusing a released one when available.
    pub fn acquire(&mut self) -> Box<RouteMessage> {
        match self.free.pop() {
            Some(msg) => {
                self.reused += 1;
                msg
            }
            None => {
                self.allocated += 1;
                Box::new(RouteMessage::blank())
            }
        }
    }

    /// Return a consumed envelope. The caller gives up ownership; the
    /// envelope is cleared before it can be handed out again.
    pub fn release(&mut self, mut msg: Box<RouteMessage>) {
        msg.clear();
        self.free.push(msg);
    }

    /// Envelopes newly allocated so far.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Acquisitions served from the free list.
    pub fn reused(&self) -> u64 {
        self.reused
    }
}
