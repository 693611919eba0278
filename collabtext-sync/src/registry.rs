//! Live documents of this process.
//!
//! A [`DocumentRoom`] bundles everything one open document needs: the
//! coordinator, the local hub and the relay subscription. Rooms are created
//! on the first session and evicted once the last session has been gone for
//! the hold period and the document has been flushed.
//!
//! Committed operations are handed to the hub and the relay outbox while the
//! document lock is held, so local editors and the broker both see them in
//! commit order.

use collabtext_core::{Operation, RawIntent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::coordinator::{CoordinatorConfig, DocumentCoordinator, DocumentId};
use crate::error::SyncError;
use crate::hub::Hub;
use crate::relay::{Relay, RelayHandle};
use crate::storage::DocumentPersistence;

/// Flush-and-check rounds before an idle but busy document is left open.
const EVICTION_ATTEMPTS: usize = 3;

/// One open document.
pub struct DocumentRoom {
    pub coordinator: Arc<DocumentCoordinator>,
    pub hub: Arc<Hub>,
    relay: RelayHandle,
}

impl DocumentRoom {
    pub fn id(&self) -> &DocumentId {
        self.coordinator.id()
    }

    /// Wait, bounded, for the relay's first subscribe attempt. Returns
    /// whether it finished in time.
    pub async fn relay_ready(&self) -> bool {
        self.relay.ready().await
    }

    /// Apply an editor intent and deliver the resulting `crdt_*` frame to
    /// every local session and the broker.
    pub async fn commit_intent(&self, intent: RawIntent, client_id: String) -> Option<Operation> {
        let doc_id = self.id();
        let deliver = |op: &Operation| match op.to_message(client_id).encode() {
            Ok(frame) => self.deliver(frame),
            Err(e) => log::error!("Failed to encode {} on {doc_id}: {e}", op.id()),
        };
        self.coordinator.commit_client_intent(intent, deliver).await
    }

    /// Merge an operation received from a client and forward `frame`
    /// verbatim if it changed the document.
    pub async fn commit_remote(&self, op: &Operation, frame: &str) -> bool {
        self.coordinator
            .commit_remote_operation(op, || self.deliver(frame.to_string()))
            .await
    }

    fn deliver(&self, frame: String) {
        if let Err(e) = self.hub.broadcast(frame.clone()) {
            log::warn!("Fan-out failed on {}: {e}", self.id());
        }
        self.relay.publish(frame);
    }
}

/// Registry of open documents, get-or-create under a double-checked lock.
pub struct DocumentRegistry {
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    store: Arc<dyn DocumentPersistence>,
    coordinator_config: CoordinatorConfig,
    mailbox_capacity: usize,
    relay: Arc<Relay>,
}

impl DocumentRegistry {
    pub fn new(
        store: Arc<dyn DocumentPersistence>,
        coordinator_config: CoordinatorConfig,
        mailbox_capacity: usize,
        relay: Arc<Relay>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            coordinator_config,
            mailbox_capacity,
            relay,
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Attach a session to `doc_id`, opening the document if needed.
    pub async fn open_session(&self, doc_id: &DocumentId) -> Result<Arc<DocumentRoom>, SyncError> {
        // Fast path: read lock. Attaching under the lock keeps eviction out.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                room.coordinator.attach();
                return Ok(room.clone());
            }
        }

        // Slow path: write lock + double-check
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            room.coordinator.attach();
            return Ok(room.clone());
        }

        let coordinator = Arc::new(DocumentCoordinator::load(
            doc_id.clone(),
            &self.coordinator_config,
            self.store.clone(),
        )?);
        let hub = Arc::new(Hub::spawn(doc_id.as_str(), self.mailbox_capacity));
        let relay = self.relay.spawn_subscription(coordinator.clone(), hub.clone());
        let room = Arc::new(DocumentRoom {
            coordinator,
            hub,
            relay,
        });
        room.coordinator.attach();
        rooms.insert(doc_id.clone(), room.clone());
        log::info!("Opened document {doc_id} ({} open)", rooms.len());
        Ok(room)
    }

    /// Detach a session. Returns the sessions still attached.
    pub fn close_session(&self, room: &DocumentRoom) -> usize {
        room.coordinator.detach()
    }

    /// Drop `doc_id` if no session is attached and its state is saved.
    /// A document whose flush fails stays open so nothing is lost.
    ///
    /// The flush runs without the registry lock; the room is only removed
    /// if it is still idle and clean once the write lock is taken.
    pub async fn evict_if_idle(&self, doc_id: &DocumentId) -> bool {
        let Some(room) = self.get(doc_id).await else {
            return false;
        };

        for _ in 0..EVICTION_ATTEMPTS {
            if room.coordinator.sessions() > 0 {
                return false;
            }
            if let Err(e) = room.coordinator.flush().await {
                log::error!("Keeping {doc_id} open, flush failed: {e}");
                return false;
            }

            let mut rooms = self.rooms.write().await;
            if !rooms.get(doc_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
                return false;
            }
            if room.coordinator.sessions() > 0 {
                return false;
            }
            if !room.coordinator.is_dirty().await {
                rooms.remove(doc_id);
                log::info!("Evicted idle document {doc_id} ({} open)", rooms.len());
                return true;
            }
            // A relayed operation landed during the flush.
        }
        log::debug!("Keeping {doc_id} open, still receiving operations");
        false
    }

    /// Flush every open document. Returns how many wrote to storage.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.read().await.values().cloned().collect();
        let mut written = 0;
        for room in rooms {
            match room.coordinator.flush().await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => log::error!("Failed to flush {}: {e}", room.id()),
            }
        }
        written
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains(&self, doc_id: &DocumentId) -> bool {
        self.rooms.read().await.contains_key(doc_id)
    }

    pub async fn get(&self, doc_id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }
}
