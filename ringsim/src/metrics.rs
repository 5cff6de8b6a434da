//! Metrics and ring-consistency reports for simulation analysis.

use chordring::{RingId, RoutingSnapshot};

/// Message counters collected by the driver.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Messages handed to the delivery phase.
    pub messages_sent: u64,
    /// Messages enqueued at their next hop.
    pub messages_delivered: u64,
    /// Messages dropped at a full incoming queue.
    pub messages_dropped: u64,
    /// Messages whose next hop no longer existed; an ERROR was synthesized
    /// back to the sender where possible.
    pub messages_bounced: u64,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of every node's routing tables at one step, in ring order.
#[derive(Debug, Clone)]
pub struct RingReport {
    /// Step at which the report was taken.
    pub step: u64,
    /// Snapshots sorted by node id.
    pub snapshots: Vec<RoutingSnapshot>,
}

impl RingReport {
    /// True when every node's direct successor is the next node in id
    /// order, wrapping at the top. This is the converged ring shape.
    pub fn ring_closed(&self) -> bool {
        let n = self.snapshots.len();
        if n == 0 {
            return true;
        }
        self.snapshots.iter().enumerate().all(|(i, snap)| {
            let expected = &self.snapshots[(i + 1) % n].id;
            snap.successor() == Some(expected)
        })
    }

    /// True when every node's predecessor is the previous node in id order.
    pub fn mutually_consistent(&self) -> bool {
        let n = self.snapshots.len();
        if n == 0 {
            return true;
        }
        self.snapshots.iter().enumerate().all(|(i, snap)| {
            let expected = self.snapshots[(i + n - 1) % n].id;
            snap.predecessor == Some(expected)
        })
    }

    /// True when no successor list carries a duplicate entry.
    pub fn lists_duplicate_free(&self) -> bool {
        self.snapshots.iter().all(|snap| {
            let mut seen: Vec<&RingId> = Vec::with_capacity(snap.successors.len());
            snap.successors.iter().all(|s| {
                if seen.contains(&s) {
                    false
                } else {
                    seen.push(s);
                    true
                }
            })
        })
    }

    /// The snapshot of one node, if present.
    pub fn node(&self, id: &RingId) -> Option<&RoutingSnapshot> {
        self.snapshots.iter().find(|s| s.id == *id)
    }
}
