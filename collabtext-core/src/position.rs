//! Dense ordering keys for sequence elements.
//!
//! A [`Position`] is a list of digits read as a mixed-radix fraction.
//! Comparison is digit-by-digit; when one key runs out first, the shorter
//! key sorts first, so a key always precedes its own extensions:
//!
//! ```text
//! [0] < [0, 7] < [3] < [3, 1] < [3, 1, 9] < [3, 2] < [10000]
//! ```
//!
//! New keys are generated strictly between two neighbours by walking their
//! digits until a gap wider than one appears, then stepping a small random
//! amount into that gap.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Upper digit bound assumed past the end of the right-hand key.
pub const POSITION_BASE: u32 = 10_000;

/// Largest random step taken into a gap. Keeps keys short when users type
/// sequentially at the same spot.
pub const POSITION_STRIDE: u32 = 10;

/// Ordering key of a character. Never mutated or reused once generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Vec<u32>);

impl Position {
    pub fn new(digits: Vec<u32>) -> Self {
        Self(digits)
    }

    /// Key of the leading sentinel.
    pub fn min() -> Self {
        Self(vec![0])
    }

    /// Key of the trailing sentinel.
    pub fn max() -> Self {
        Self(vec![POSITION_BASE])
    }

    pub fn digits(&self) -> &[u32] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u32>> for Position {
    fn from(digits: Vec<u32>) -> Self {
        Self(digits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("cannot generate a position between {prev:?} and {next:?}: bounds are not ordered")]
    Unordered { prev: Vec<u32>, next: Vec<u32> },
    #[error("no position exists between {prev:?} and {next:?}")]
    NoRoom { prev: Vec<u32>, next: Vec<u32> },
}

/// Total order over positions.
///
/// Lexicographic over digits, with a strict prefix sorting before any of its
/// extensions. Matches the derived `Ord` on [`Position`].
pub fn compare_positions(a: &Position, b: &Position) -> Ordering {
    let shared = a.0.len().min(b.0.len());
    for i in 0..shared {
        match a.0[i].cmp(&b.0[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.0.len().cmp(&b.0.len())
}

/// Generate a fresh key strictly between `prev` and `next`.
///
/// Digits past the end of `prev` read as `0`. Once the walk has copied a
/// digit that is below `next`'s, the upper bound is released and reads as
/// [`POSITION_BASE`]. At the first index whose gap exceeds one the new digit
/// is `prev[i] + step` with `step` drawn from
/// `1..=min(POSITION_STRIDE, gap - 1)`; otherwise the lower digit is copied
/// and the walk descends one level.
///
/// Two peers generating in the same gap concurrently may pick the same key.
/// Nothing here detects that.
pub fn generate_between<R: Rng + ?Sized>(
    prev: &Position,
    next: &Position,
    rng: &mut R,
) -> Result<Position, PositionError> {
    if compare_positions(prev, next) != Ordering::Less {
        return Err(PositionError::Unordered {
            prev: prev.0.clone(),
            next: next.0.clone(),
        });
    }

    let mut digits = Vec::with_capacity(prev.depth().max(next.depth()) + 1);
    let mut bounded = true;
    let mut i = 0;
    loop {
        let lo = prev.0.get(i).copied().unwrap_or(0);
        let hi = if bounded {
            match next.0.get(i) {
                Some(&d) => d,
                // Everything copied so far equals `next`, and every
                // extension of it sorts after it.
                None => {
                    return Err(PositionError::NoRoom {
                        prev: prev.0.clone(),
                        next: next.0.clone(),
                    })
                }
            }
        } else {
            POSITION_BASE
        };

        if hi > lo && hi - lo > 1 {
            let step = rng.gen_range(1..=POSITION_STRIDE.min(hi - lo - 1));
            digits.push(lo + step);
            return Ok(Position(digits));
        }
        if hi > lo {
            bounded = false;
        }

        digits.push(lo);
        i += 1;
    }
}

/// [`generate_between`] with the thread-local RNG.
pub fn generate_between_random(prev: &Position, next: &Position) -> Result<Position, PositionError> {
    generate_between(prev, next, &mut rand::thread_rng())
}
