//! Chord overlay protocol engine.
//!
//! Implements the Chord structured-overlay protocol as a deterministic,
//! message-driven state machine: fixed-width ring identifiers with modular
//! arithmetic, finger tables, successor lists, and the periodic
//! stabilization that keeps them converging while nodes join, leave, and
//! fail.
//!
//! The engine is transport-agnostic. Nodes never touch a socket or a clock;
//! they consume and produce pooled [`message::RouteMessage`] envelopes and
//! are advanced step by step by whatever driver owns them (see the
//! companion simulator crate). Applications attach behind the
//! [`traits::EndPoint`] seam and drivers talk to nodes through
//! [`traits::OverlayNode`].
//!
//! Nothing in the engine blocks. An operation that needs a remote answer
//! registers a one-shot continuation keyed by a correlation string and
//! resumes when the matching reply arrives, which keeps every node
//! single-threaded and every run reproducible.

#![forbid(unsafe_code)]

pub mod config;
pub mod handle;
pub mod id;
pub mod message;
pub mod node;
pub mod snapshot;
pub mod traits;

pub use config::{ConfigError, RingConfig};
pub use handle::NodeHandle;
pub use id::{IdError, RingId, MAX_KEY_BITS};
pub use message::{MessageKind, MessageMode, MessagePool, Payload, RouteMessage};
pub use node::ChordNode;
pub use snapshot::{NetworkSnapshot, NodeRole, NodeState, RoutingSnapshot};
pub use traits::{EndPoint, OverlayNode};
