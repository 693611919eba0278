//! Per-document owner of the authoritative sequence.
//!
//! ```text
//!  raw_insert / raw_delete ──► apply_client_intent ──► Operation ──► hub + relay
//!  crdt_insert / crdt_delete ─► apply_remote_operation ─► bool (changed?)
//!                                      │
//!                                      ▼
//!                           Mutex<DocumentState>
//!                           ├── Sequence
//!                           ├── PeerClock (own peer id)
//!                           └── debounce gate ──► dyn DocumentPersistence
//! ```
//!
//! Every read and mutation of a document happens under its own lock. The
//! lock is never held across network I/O; the only I/O inside it is the
//! already rate-limited persistence write and the occasional clock
//! reservation. Commit hooks run before the lock is released, so whatever
//! they enqueue is in commit order.
//!
//! Clocks are reserved in blocks of [`CLOCK_RESERVATION`]: before the own
//! clock passes the stored reservation, the next block is recorded. A
//! reload resumes after the reservation, so no id is ever issued twice,
//! even for characters deleted before the restart.

use collabtext_core::{
    generate_between, Char, CharId, Message, Operation, PeerClock, RawIntent, Sequence,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::storage::{DocumentPersistence, StoreError};

/// Maximum length of a document id.
pub const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Clocks reserved per write of the clock record.
pub const CLOCK_RESERVATION: u64 = 64;

/// Validated document identifier: 1–128 chars of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_DOCUMENT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(SyncError::InvalidDocumentId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Broker channel carrying this document's operations.
    pub fn channel(&self) -> String {
        format!("updates:{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity stamped on every character this process creates
    pub peer_id: String,
    /// Minimum time between two persistence writes (default: 5s)
    pub save_debounce: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().to_string(),
            save_debounce: Duration::from_secs(5),
        }
    }
}

struct DocumentState {
    sequence: Sequence,
    clock: PeerClock,
    /// Highest clock covered by the stored reservation
    reserved: u64,
    /// Time of the last successful write, `None` before the first one
    last_saved: Option<Instant>,
    dirty: bool,
}

/// Owner of one document's sequence.
pub struct DocumentCoordinator {
    doc_id: DocumentId,
    store: Arc<dyn DocumentPersistence>,
    save_debounce: Duration,
    state: Mutex<DocumentState>,
    sessions: AtomicUsize,
}

impl DocumentCoordinator {
    /// Load `doc_id` from `store`, or create and immediately persist the
    /// two-sentinel document if it has never been saved.
    pub fn load(
        doc_id: DocumentId,
        config: &CoordinatorConfig,
        store: Arc<dyn DocumentPersistence>,
    ) -> Result<Self, SyncError> {
        let (sequence, last_saved, dirty) = match store.load(&doc_id)? {
            Some(bytes) => {
                let sequence = Sequence::from_json(&bytes)?;
                log::info!(
                    "Loaded document {doc_id} ({} characters)",
                    sequence.visible_len()
                );
                (sequence, None, false)
            }
            None => {
                let sequence = Sequence::new();
                let saved = match sequence.to_json() {
                    Ok(bytes) => store.save(&doc_id, &bytes),
                    Err(e) => Err(StoreError::Serialization(e.to_string())),
                };
                match saved {
                    Ok(()) => {
                        log::info!("Created document {doc_id}");
                        (sequence, Some(Instant::now()), false)
                    }
                    Err(e) => {
                        log::error!("Failed to persist new document {doc_id}: {e}");
                        (sequence, None, true)
                    }
                }
            }
        };

        let reserved = store
            .load_clock(&doc_id, &config.peer_id)?
            .unwrap_or(0)
            .max(sequence.max_clock(&config.peer_id));
        let clock = PeerClock::resume(config.peer_id.clone(), reserved);

        Ok(Self {
            doc_id,
            store,
            save_debounce: config.save_debounce,
            state: Mutex::new(DocumentState {
                sequence,
                clock,
                reserved,
                last_saved,
                dirty,
            }),
            sessions: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Turn an editor's visible-index intent into a replicated operation.
    ///
    /// Indices are offset by one past the start sentinel. Inserts clamp into
    /// range; deletes outside the visible characters are dropped. Returns
    /// `None` when nothing was applied.
    pub async fn apply_client_intent(&self, intent: RawIntent) -> Option<Operation> {
        self.commit_client_intent(intent, |_| {}).await
    }

    /// [`apply_client_intent`](Self::apply_client_intent), handing the new
    /// operation to `deliver` while the document is still locked.
    pub async fn commit_client_intent<F>(&self, intent: RawIntent, deliver: F) -> Option<Operation>
    where
        F: FnOnce(&Operation),
    {
        let mut state = self.state.lock().await;
        let op = match intent {
            RawIntent::Insert { index, value } => self.insert_at(&mut state, index, value)?,
            RawIntent::Delete { index } => self.delete_at(&mut state, index)?,
        };
        self.mark_dirty(&mut state);
        deliver(&op);
        Some(op)
    }

    fn insert_at(&self, state: &mut DocumentState, index: i64, value: String) -> Option<Operation> {
        if value.is_empty() {
            log::warn!("Dropping empty insert on {}", self.doc_id);
            return None;
        }
        let len = state.sequence.len();
        let slot = index.saturating_add(1).clamp(1, len as i64 - 1) as usize;
        let prev = &state.sequence.char_at(slot - 1)?.position;
        let next = &state.sequence.char_at(slot)?.position;

        let position = match generate_between(prev, next, &mut rand::thread_rng()) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Dropping insert at {index} on {}: {e}", self.doc_id);
                return None;
            }
        };

        let ch = Char::new(self.next_id(state), value, position);
        state.sequence.apply_insert(ch.clone());
        Some(Operation::Insert(ch))
    }

    /// Tick the own clock, extending the stored reservation first when the
    /// clock has caught up with it. A failed reservation is retried on the
    /// next tick.
    fn next_id(&self, state: &mut DocumentState) -> CharId {
        if state.clock.current() >= state.reserved {
            let reserved = state.clock.current() + CLOCK_RESERVATION;
            match self
                .store
                .save_clock(&self.doc_id, state.clock.peer_id(), reserved)
            {
                Ok(()) => state.reserved = reserved,
                Err(e) => log::error!("Failed to reserve clocks on {}: {e}", self.doc_id),
            }
        }
        state.clock.tick()
    }

    fn delete_at(&self, state: &mut DocumentState, index: i64) -> Option<Operation> {
        let len = state.sequence.len();
        if index < 0 || index.saturating_add(1) >= len as i64 - 1 {
            log::debug!(
                "Ignoring delete at {index} on {} ({} visible)",
                self.doc_id,
                len - 2
            );
            return None;
        }
        let ch = state.sequence.char_at(index as usize + 1)?.clone();
        state.sequence.apply_delete(&ch.id);
        Some(Operation::Delete(ch))
    }

    /// Merge an operation produced elsewhere. Returns whether it changed the
    /// document; duplicates and echoes return `false`.
    pub async fn apply_remote_operation(&self, op: &Operation) -> bool {
        self.commit_remote_operation(op, || {}).await
    }

    /// [`apply_remote_operation`](Self::apply_remote_operation), running
    /// `deliver` under the document lock when the operation changed the
    /// document.
    pub async fn commit_remote_operation<F>(&self, op: &Operation, deliver: F) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock().await;
        let changed = state.sequence.apply(op);
        if changed {
            self.mark_dirty(&mut state);
            deliver();
        } else {
            log::trace!("No-op {} for {} on {}", op_kind(op), op.id(), self.doc_id);
        }
        changed
    }

    /// `load` frame with the full current sequence.
    pub async fn load_message(&self) -> Message {
        Message::load(&self.state.lock().await.sequence)
    }

    pub async fn snapshot(&self) -> Sequence {
        self.state.lock().await.sequence.clone()
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.sequence.text()
    }

    /// Write the document now if it has unsaved changes. Returns whether a
    /// write happened.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(false);
        }
        self.persist(&mut state)?;
        Ok(true)
    }

    /// Whether there are mutations not yet written to the store.
    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Count a new connected session. Returns the new count.
    pub fn attach(&self) -> usize {
        self.sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop a session. Returns the remaining count.
    pub fn detach(&self) -> usize {
        let prev = self
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn mark_dirty(&self, state: &mut DocumentState) {
        state.dirty = true;
        let due = state
            .last_saved
            .map_or(true, |t| t.elapsed() >= self.save_debounce);
        if due {
            if let Err(e) = self.persist(state) {
                log::error!("Failed to persist {}: {e}", self.doc_id);
            }
        }
    }

    fn persist(&self, state: &mut DocumentState) -> Result<(), StoreError> {
        let bytes = state
            .sequence
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.save(&self.doc_id, &bytes)?;
        state.last_saved = Some(Instant::now());
        state.dirty = false;
        log::debug!("Persisted {} ({} bytes)", self.doc_id, bytes.len());
        Ok(())
    }
}

fn op_kind(op: &Operation) -> &'static str {
    match op {
        Operation::Insert(_) => "insert",
        Operation::Delete(_) => "delete",
    }
}
