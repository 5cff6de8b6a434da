//! Read-only routing snapshots and persisted node state.
//!
//! [`RoutingSnapshot`] is the export boundary: a key/value view of one
//! node's routing tables for external graph or statistics tooling. The
//! engine exposes the snapshot; it never performs export itself.
//!
//! [`NodeState`] is the persistence form of a node's routing state. A
//! whole-network snapshot serializes one per node plus the step counter and
//! can be restored as the starting state of a driver, bypassing the
//! incremental join path entirely.

use serde::{Deserialize, Serialize};

use crate::handle::NodeHandle;
use crate::id::RingId;

/// Read-only view of one node's routing tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub id: RingId,
    pub predecessor: Option<RingId>,
    /// Successor list in successor order.
    pub successors: Vec<RingId>,
    /// Finger table; slot `k` (1-based) targets `id + 2^(k-1)`.
    pub fingers: Vec<RingId>,
}

impl RoutingSnapshot {
    /// The direct successor, if the node knows one.
    pub fn successor(&self) -> Option<&RingId> {
        self.successors.first()
    }

    /// Flatten into (key, value) string pairs for external export.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(2 + self.successors.len() + self.fingers.len());
        out.push(("id".to_string(), self.id.to_string()));
        out.push((
            "predecessor".to_string(),
            self.predecessor
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ));
        for (i, s) in self.successors.iter().enumerate() {
            out.push((format!("successor[{i}]"), s.to_string()));
        }
        for (k, f) in self.fingers.iter().enumerate() {
            out.push((format!("finger[{}]", k + 1), f.to_string()));
        }
        out
    }
}

/// Role of a node in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Waiting for the join handshake to install a successor.
    Joining,
    /// Fully routing-capable.
    Active,
    /// Announced departure; answers in-flight control traffic only.
    Leaving,
    /// Dead with no notification.
    Failed,
}

/// Persisted routing state of one Chord node.
///
/// Queues, continuations, and in-flight traffic are deliberately not part
/// of the state: a restored network resumes from its tables and re-converges
/// through normal stabilization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub handle: NodeHandle,
    pub role: NodeRole,
    pub predecessor: Option<NodeHandle>,
    pub successors: Vec<NodeHandle>,
    pub fingers: Vec<NodeHandle>,
    /// Next finger slot the fix-finger task will refresh.
    pub next_finger_slot: u16,
}

/// Persisted state of a whole network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Step counter at the time of the snapshot.
    pub step: u64,
    /// One state per live node, in ring order.
    pub nodes: Vec<NodeState>,
}
