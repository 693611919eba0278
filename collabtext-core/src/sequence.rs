//! Sequence CRDT: an ordered run of identified characters.
//!
//! The sequence is kept sorted by [`Position`] and bounded by two sentinels
//! that are never removed. Inserts and deletes are addressed by identity, not
//! by index, so they commute: any two replicas that saw the same set of
//! operations hold the same characters in the same order, regardless of
//! delivery order or duplication.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::CharId;
use crate::position::Position;

/// A single character of the document.
///
/// Every field defaults when absent: an editor's `raw_insert` carries only
/// `value`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Char {
    pub id: CharId,
    /// One grapheme. Empty for sentinels.
    pub value: String,
    pub position: Position,
}

impl Char {
    pub fn new(id: CharId, value: impl Into<String>, position: Position) -> Self {
        Self {
            id,
            value: value.into(),
            position,
        }
    }

    pub fn start_sentinel() -> Self {
        Self::new(CharId::start(), "", Position::min())
    }

    pub fn end_sentinel() -> Self {
        Self::new(CharId::end(), "", Position::max())
    }

    pub fn is_sentinel(&self) -> bool {
        self.id.is_sentinel()
    }

    /// Order within a sequence. Equal positions (two peers picked the same
    /// key concurrently) fall back to identity so every replica agrees.
    fn sort_key(&self) -> (&Position, &CharId) {
        (&self.position, &self.id)
    }
}

/// Replicated operation on a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Add a character at its own position
    Insert(Char),
    /// Remove the character with this identity. Carries the full character
    /// because that is what goes on the wire.
    Delete(Char),
}

impl Operation {
    /// Character the operation refers to.
    pub fn char(&self) -> &Char {
        match self {
            Operation::Insert(c) | Operation::Delete(c) => c,
        }
    }

    pub fn id(&self) -> &CharId {
        &self.char().id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("snapshot is not valid JSON: {0}")]
    Encoding(String),
}

/// Sorted, sentinel-bounded list of characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    chars: Vec<Char>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence {
    /// The empty document: just the two sentinels.
    pub fn new() -> Self {
        Self {
            chars: vec![Char::start_sentinel(), Char::end_sentinel()],
        }
    }

    /// Rebuild a sequence from a stored snapshot, checking every invariant.
    pub fn from_chars(chars: Vec<Char>) -> Result<Self, SequenceError> {
        let (first, last) = match (chars.first(), chars.last()) {
            (Some(first), Some(last)) if chars.len() >= 2 => (first, last),
            _ => {
                return Err(SequenceError::CorruptSnapshot(format!(
                    "expected at least two sentinels, found {} characters",
                    chars.len()
                )))
            }
        };
        if first.id != CharId::start() || last.id != CharId::end() {
            return Err(SequenceError::CorruptSnapshot(
                "sequence is not bounded by the start and end sentinels".into(),
            ));
        }

        let interior = &chars[1..chars.len() - 1];
        if let Some(c) = interior
            .iter()
            .find(|c| c.position <= first.position || c.position >= last.position)
        {
            return Err(SequenceError::CorruptSnapshot(format!(
                "{} shares or passes a sentinel position",
                c.id
            )));
        }

        for pair in chars.windows(2) {
            if pair[0].sort_key() >= pair[1].sort_key() {
                return Err(SequenceError::CorruptSnapshot(format!(
                    "positions out of order at {} / {}",
                    pair[0].id, pair[1].id
                )));
            }
        }

        let mut seen = std::collections::HashSet::with_capacity(chars.len());
        for c in &chars {
            if !seen.insert(&c.id) {
                return Err(SequenceError::CorruptSnapshot(format!("duplicate id {}", c.id)));
            }
        }

        Ok(Self { chars })
    }

    /// Decode the JSON array form used for persistence and `load` snapshots.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SequenceError> {
        let chars: Vec<Char> =
            serde_json::from_slice(bytes).map_err(|e| SequenceError::Encoding(e.to_string()))?;
        Self::from_chars(chars)
    }

    /// Encode as a JSON array of characters, sentinels included.
    pub fn to_json(&self) -> Result<Vec<u8>, SequenceError> {
        serde_json::to_vec(&self.chars).map_err(|e| SequenceError::Encoding(e.to_string()))
    }

    /// Merge an insert. Returns `false` if the id is already present or the
    /// position is not strictly between the sentinels' positions.
    pub fn apply_insert(&mut self, ch: Char) -> bool {
        if self.contains(&ch.id) || !self.within_bounds(&ch.position) {
            return false;
        }
        let key = ch.sort_key();
        // First slot whose key sorts after the new one.
        let at = self.chars.partition_point(|c| c.sort_key() < key);
        self.chars.insert(at, ch);
        true
    }

    /// A character sharing a sentinel's position would leave no key between
    /// it and that sentinel.
    fn within_bounds(&self, position: &Position) -> bool {
        match (self.chars.first(), self.chars.last()) {
            (Some(first), Some(last)) => first.position < *position && *position < last.position,
            _ => false,
        }
    }

    /// Merge a delete. Returns `false` if the id is absent.
    ///
    /// Sentinels are never removed.
    pub fn apply_delete(&mut self, id: &CharId) -> bool {
        if id.is_sentinel() {
            return false;
        }
        match self.chars.iter().position(|c| &c.id == id) {
            Some(at) => {
                self.chars.remove(at);
                true
            }
            None => false,
        }
    }

    /// Merge any operation.
    pub fn apply(&mut self, op: &Operation) -> bool {
        match op {
            Operation::Insert(c) => self.apply_insert(c.clone()),
            Operation::Delete(c) => self.apply_delete(&c.id),
        }
    }

    pub fn contains(&self, id: &CharId) -> bool {
        self.chars.iter().any(|c| &c.id == id)
    }

    /// Number of characters including both sentinels.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// Always false: sentinels are permanent.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Number of characters the user sees.
    pub fn visible_len(&self) -> usize {
        self.chars.len() - 2
    }

    /// Character at a raw slot (slot 0 is the start sentinel).
    pub fn char_at(&self, slot: usize) -> Option<&Char> {
        self.chars.get(slot)
    }

    pub fn chars(&self) -> &[Char] {
        &self.chars
    }

    /// Visible characters, sentinels excluded.
    pub fn visible(&self) -> &[Char] {
        &self.chars[1..self.chars.len() - 1]
    }

    /// Rendered text.
    pub fn text(&self) -> String {
        self.visible().iter().map(|c| c.value.as_str()).collect()
    }

    /// Highest clock value stamped by `peer_id`, or 0.
    pub fn max_clock(&self, peer_id: &str) -> u64 {
        self.chars
            .iter()
            .filter(|c| c.id.peer_id == peer_id)
            .map(|c| c.id.clock)
            .max()
            .unwrap_or(0)
    }

    pub fn into_chars(self) -> Vec<Char> {
        self.chars
    }
}
