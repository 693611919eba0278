//! # collabtext-core — Sequence CRDT for collaborative plain text
//!
//! Every character carries a globally unique identity and a dense ordering
//! key, so concurrent inserts and deletes commute and replicas converge
//! without coordination.
//!
//! ## Architecture
//!
//! ```text
//!  RawIntent (insert/delete at visible index)
//!        │  coordinator (collabtext-sync)
//!        ▼
//!  generate_between(prev, next) ──► Position
//!  PeerClock::tick()            ──► CharId
//!        │
//!        ▼
//!  Operation::Insert / Delete ──► Sequence::apply  (idempotent merge)
//!        │
//!        ▼
//!  Message (JSON wire frame) ──► hub / broker / other replicas
//! ```
//!
//! ## Modules
//!
//! - [`id`] — character identity and per-peer logical clocks
//! - [`position`] — ordering keys and the between-generator
//! - [`sequence`] — the sentinel-bounded sorted sequence and its merge
//! - [`protocol`] — JSON frames exchanged with editors and peers

pub mod id;
pub mod position;
pub mod protocol;
pub mod sequence;

pub use id::{CharId, PeerClock, END_PEER, START_PEER};
pub use position::{
    compare_positions, generate_between, generate_between_random, Position, PositionError,
    POSITION_BASE, POSITION_STRIDE,
};
pub use protocol::{Message, OpFrame, PresenceFrame, ProtocolError, RawIntent};
pub use sequence::{Char, Operation, Sequence, SequenceError};
