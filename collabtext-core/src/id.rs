//! Character identity.
//!
//! Every character ever inserted is stamped with a `(clock, peer_id)` pair.
//! A peer only ever increments its own clock, so two peers can never mint the
//! same pair and identities stay unique without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved peer identity of the leading sentinel.
pub const START_PEER: &str = "start";

/// Reserved peer identity of the trailing sentinel.
pub const END_PEER: &str = "end";

/// Globally unique identity of a character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharId {
    /// Logical clock of the originating peer at creation time
    pub clock: u64,
    /// Stable identity of the originating peer
    #[serde(rename = "peerID")]
    pub peer_id: String,
}

impl CharId {
    pub fn new(clock: u64, peer_id: impl Into<String>) -> Self {
        Self {
            clock,
            peer_id: peer_id.into(),
        }
    }

    /// Identity of the leading sentinel.
    pub fn start() -> Self {
        Self::new(0, START_PEER)
    }

    /// Identity of the trailing sentinel.
    pub fn end() -> Self {
        Self::new(0, END_PEER)
    }

    /// Whether this id belongs to one of the two boundary sentinels.
    pub fn is_sentinel(&self) -> bool {
        self.clock == 0 && (self.peer_id == START_PEER || self.peer_id == END_PEER)
    }
}

impl Default for CharId {
    fn default() -> Self {
        Self::new(0, String::new())
    }
}

impl fmt::Display for CharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.peer_id)
    }
}

/// A peer's private, strictly increasing logical clock.
#[derive(Debug, Clone)]
pub struct PeerClock {
    peer_id: String,
    clock: u64,
}

impl PeerClock {
    /// Start a clock for `peer_id` that continues after `last_seen`.
    pub fn resume(peer_id: impl Into<String>, last_seen: u64) -> Self {
        Self {
            peer_id: peer_id.into(),
            clock: last_seen,
        }
    }

    pub fn new(peer_id: impl Into<String>) -> Self {
        Self::resume(peer_id, 0)
    }

    /// Mint the next identity for this peer.
    pub fn tick(&mut self) -> CharId {
        self.clock += 1;
        CharId::new(self.clock, self.peer_id.clone())
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Last clock value handed out.
    pub fn current(&self) -> u64 {
        self.clock
    }
}
