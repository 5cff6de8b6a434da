//! Node handles: a ring id paired with a liveness flag.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::id::RingId;

/// A reference to a logical node on the ring.
///
/// Handles are value-like: many nodes hold copies referring to the same
/// logical node. Identity is the id alone; the liveness flag is excluded
/// from equality, ordering, and hashing, and is flipped only by the owning
/// node or the network driver.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct NodeHandle {
    id: RingId,
    alive: bool,
}

impl NodeHandle {
    /// Create a live handle for the given id.
    pub fn new(id: RingId) -> Self {
        Self { id, alive: true }
    }

    /// The node's ring id.
    pub fn id(&self) -> &RingId {
        &self.id
    }

    /// Whether the node was alive when the flag was last updated.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Flip the liveness flag. Reserved to the owning node and the driver.
    pub fn set_alive(&mut self, alive: bool) {
        self.alive = alive;
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeHandle {}

impl PartialOrd for NodeHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeHandle({}{})",
            self.id,
            if self.alive { "" } else { ", down" }
        )
    }
}
