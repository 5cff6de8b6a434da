//! Trait seams between the protocol engine, the driver, and applications.
//!
//! The network driver is written against [`OverlayNode`] only; the Chord
//! node is the canonical implementation, and alternate overlay variants
//! (for instance a continuous-identifier small-world protocol) plug in
//! behind the same contract. Applications sit behind [`EndPoint`].

use crate::handle::NodeHandle;
use crate::id::RingId;
use crate::message::{MessagePool, RouteMessage};
use crate::snapshot::RoutingSnapshot;

/// Application boundary.
///
/// The engine pushes application-addressed payloads outward through this
/// trait and never interprets their contents.
pub trait EndPoint {
    /// Called when application data transits this node on the way to its
    /// destination. Returning `false` vetoes further forwarding.
    fn forward(&mut self, payload: &[u8]) -> bool;

    /// Called when this node is responsible for `key` and delivers the
    /// payload locally.
    fn deliver(&mut self, key: &RingId, payload: &[u8]);
}

/// A protocol node as seen by the network driver.
///
/// All methods are non-blocking: an operation that conceptually waits for a
/// reply registers a keyed continuation internally and returns. Queues are
/// owned by the node; the driver only ever takes the outgoing queue and
/// offers to the incoming one.
pub trait OverlayNode {
    /// The node's handle (id plus current liveness).
    fn handle(&self) -> NodeHandle;

    /// Whether the node still participates in the network. Nodes that stop
    /// being alive are reclaimed by the driver at the end of the step.
    fn is_alive(&self) -> bool;

    /// Enter the ring. With no bootstrap the node starts a ring of one;
    /// otherwise it opens the find-successor handshake through `bootstrap`.
    fn join(&mut self, bootstrap: Option<NodeHandle>, pool: &mut MessagePool);

    /// Leave gracefully: hand the neighbors their new pointers, then stop.
    fn leave(&mut self, pool: &mut MessagePool);

    /// Fail abruptly: no notification, outgoing traffic suppressed.
    fn fail(&mut self);

    /// Run due periodic tasks and drain up to the configured budget of
    /// incoming messages. Returns `true` while the node still considers
    /// itself stabilizing (or holds outstanding application traffic).
    fn process(&mut self, step: u64, pool: &mut MessagePool) -> bool;

    /// Offer a message to the bounded incoming queue; the message is handed
    /// back when the queue is full.
    fn enqueue_incoming(&mut self, msg: Box<RouteMessage>) -> Result<(), Box<RouteMessage>>;

    /// Take every queued outgoing message. Failed nodes yield nothing.
    fn take_outgoing(&mut self) -> Vec<Box<RouteMessage>>;

    /// Application entry: route `payload` toward the node responsible for
    /// `dest`, optionally via a first-hop hint.
    fn route(
        &mut self,
        dest: RingId,
        payload: Vec<u8>,
        hint: Option<NodeHandle>,
        pool: &mut MessagePool,
    );

    /// Application entry: broadcast `payload` to every node on the ring.
    fn broadcast(&mut self, payload: Vec<u8>, pool: &mut MessagePool);

    /// Read-only view of the routing state for export and checks.
    fn routing_snapshot(&self) -> RoutingSnapshot;
}

/// Test implementations of the external interfaces.
pub mod test_impls {
    use super::EndPoint;
    use crate::id::RingId;

    /// An endpoint that records every delivery and forwards everything.
    #[derive(Debug, Default)]
    pub struct CollectingEndPoint {
        /// Locally delivered (key, payload) pairs, in arrival order.
        pub delivered: Vec<(RingId, Vec<u8>)>,
        /// Number of transit forwards observed.
        pub forwarded: u64,
    }

    impl CollectingEndPoint {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl EndPoint for CollectingEndPoint {
        fn forward(&mut self, _payload: &[u8]) -> bool {
            self.forwarded += 1;
            true
        }

        fn deliver(&mut self, key: &RingId, payload: &[u8]) {
            self.delivered.push((*key, payload.to_vec()));
        }
    }

    /// An endpoint that discards everything.
    #[derive(Debug, Default)]
    pub struct NullEndPoint;

    impl EndPoint for NullEndPoint {
        fn forward(&mut self, _payload: &[u8]) -> bool {
            true
        }

        fn deliver(&mut self, _key: &RingId, _payload: &[u8]) {}
    }
}
