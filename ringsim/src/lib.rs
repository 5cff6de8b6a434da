//! ringsim - Lock-step network simulator for the chordring overlay.
//!
//! Drives whole rings of [`chordring`] nodes in a single process with no
//! real time and no sockets: one step lets every node process, then moves
//! every outgoing message to its next hop. A message sent in step `n` is
//! seen in step `n + 1`, so every hop costs exactly one step and a run is
//! fully determined by its seed.
//!
//! # Features
//!
//! - **Lock-step stepping**: processing strictly before delivery, in id order
//! - **Churn**: incremental joins, graceful leaves, abrupt failures
//! - **ERROR synthesis**: delivery to a vanished node bounces an ERROR to
//!   the sender, which repairs through its successor list
//! - **Quiescence detection**: `stabilize` runs until no node reports work
//! - **Ring reports**: closed-ring and mutual-consistency checks
//! - **Persistence**: whole-network snapshots that restore and resume
//!
//! # Example
//!
//! ```
//! use ringsim::ScenarioBuilder;
//!
//! let (mut driver, _ids) = ScenarioBuilder::new(4).with_seed(7).build();
//! assert!(driver.stabilize(5_000));
//! assert!(driver.report().ring_closed());
//! ```

#![forbid(unsafe_code)]

pub mod driver;
pub mod metrics;
pub mod scenario;

pub use chordring::{ChordNode, NetworkSnapshot, OverlayNode, RingConfig, RingId};
pub use driver::NetworkDriver;
pub use metrics::{RingReport, SimMetrics};
pub use scenario::{IdPlacement, ScenarioBuilder};
