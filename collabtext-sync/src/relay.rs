//! Bridge between a document's coordinator and the pub/sub broker.
//!
//! ```text
//!            RelayHandle::publish / publish_presence
//!  local ops ─────────────────────────────────────► Broker "updates:{doc}"
//!                                                          │
//!  Hub ◄── re-broadcast if changed ◄── apply_remote ◄──────┘ subscription task
//!                                                     (reconnects with backoff)
//! ```
//!
//! Operations leave through a per-document outbox: frames are queued under
//! the document lock and a single task publishes them in that order, so a
//! slow broker delays delivery but never reorders it. Operations published
//! while the broker is unreachable are lost for that link; forward delivery
//! resumes on the next successful subscription.

use collabtext_core::{Message, PresenceFrame};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broker::{Broker, Subscription};
use crate::coordinator::{DocumentCoordinator, DocumentId};
use crate::hub::Hub;
use crate::presence::{Origin, PresenceConfig, PresenceStore};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// First reconnect delay (default: 500ms)
    pub initial_backoff: Duration,
    /// Reconnect delay cap (default: 5s)
    pub max_backoff: Duration,
    /// Longest a new session waits for the first subscribe attempt
    /// (default: 2s)
    pub ready_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(2),
        }
    }
}

impl RelayConfig {
    /// Delay after `delay`, doubled and capped.
    pub fn next_backoff(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_backoff)
    }
}

/// Handle to one document's subscription task and outbox. Dropping it stops
/// the subscription; frames already queued are still published.
pub struct RelayHandle {
    task: JoinHandle<()>,
    ready: watch::Receiver<bool>,
    ready_timeout: Duration,
    outbox: mpsc::UnboundedSender<String>,
}

impl RelayHandle {
    /// Wait until the first subscribe attempt has finished, successful or
    /// not, or the ready timeout passes. Returns whether it finished.
    pub async fn ready(&self) -> bool {
        let mut ready = self.ready.clone();
        matches!(
            tokio::time::timeout(self.ready_timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        )
    }

    /// Queue an encoded `crdt_*` frame for publishing. Never blocks.
    pub fn publish(&self, frame: String) {
        if self.outbox.send(frame).is_err() {
            log::warn!("Relay outbox closed, dropping frame");
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Process-wide relay shared by every document.
pub struct Relay {
    broker: Arc<dyn Broker>,
    config: RelayConfig,
    presence: PresenceStore,
}

impl Relay {
    pub fn new(broker: Arc<dyn Broker>, config: RelayConfig, presence: PresenceConfig) -> Self {
        Self {
            broker,
            config,
            presence: PresenceStore::new(presence),
        }
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// Start the subscription loop feeding `coordinator` and `hub`.
    pub fn spawn_subscription(
        self: &Arc<Self>,
        coordinator: Arc<DocumentCoordinator>,
        hub: Arc<Hub>,
    ) -> RelayHandle {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let relay = self.clone();
        let doc_id = coordinator.id().clone();
        tokio::spawn(async move {
            relay.drain_outbox(doc_id, outbox_rx).await;
        });

        let relay = self.clone();
        let task = tokio::spawn(async move {
            relay.subscription_loop(coordinator, hub, ready_tx).await;
        });
        RelayHandle {
            task,
            ready: ready_rx,
            ready_timeout: self.config.ready_timeout,
            outbox: outbox_tx,
        }
    }

    /// Publish queued frames one at a time until the handle is dropped.
    async fn drain_outbox(&self, doc_id: DocumentId, mut outbox: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = outbox.recv().await {
            self.publish_operation(&doc_id, frame).await;
        }
        log::debug!("Relay outbox for {doc_id} closed");
    }

    async fn subscription_loop(
        &self,
        coordinator: Arc<DocumentCoordinator>,
        hub: Arc<Hub>,
        ready: watch::Sender<bool>,
    ) {
        let channel = coordinator.id().channel();
        let mut backoff = self.config.initial_backoff;

        loop {
            let attempt = self.broker.subscribe(&channel).await;
            ready.send_replace(true);

            match attempt {
                Ok(subscription) => {
                    log::info!("Relay subscribed to {channel}");
                    backoff = self.config.initial_backoff;
                    self.forward(subscription, &coordinator, &hub).await;
                    log::warn!("Relay subscription to {channel} ended");
                }
                Err(e) => {
                    log::warn!("Relay could not subscribe to {channel}: {e}");
                }
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 10);
            let delay = backoff + Duration::from_millis(jitter);
            log::debug!("Relay retrying {channel} in {delay:?}");
            tokio::time::sleep(delay).await;
            backoff = self.config.next_backoff(backoff);
        }
    }

    async fn forward(
        &self,
        mut subscription: Subscription,
        coordinator: &DocumentCoordinator,
        hub: &Hub,
    ) {
        while let Some(payload) = subscription.next().await {
            self.handle_remote(coordinator, hub, payload).await;
        }
    }

    /// Apply one payload received from the broker.
    pub async fn handle_remote(&self, coordinator: &DocumentCoordinator, hub: &Hub, payload: String) {
        let doc_id = coordinator.id();
        let msg = match Message::decode(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Relay dropping malformed frame on {doc_id}: {e}");
                return;
            }
        };

        match msg {
            Message::CrdtInsert(_) | Message::CrdtDelete(_) => {
                let Some((op, _)) = msg.into_operation() else {
                    return;
                };
                let fan_out = || {
                    if let Err(e) = hub.broadcast(payload) {
                        log::warn!("Relay could not fan out on {doc_id}: {e}");
                    }
                };
                if coordinator.commit_remote_operation(&op, fan_out).await {
                    log::trace!("Relay applied remote {} on {doc_id}", op.id());
                }
            }
            Message::PresenceUpdate { users } => {
                if self.presence.merge(doc_id, &users, Origin::Relayed) {
                    self.broadcast_presence(doc_id, hub);
                }
            }
            other => {
                log::debug!("Relay ignoring {} on {doc_id}", other.action());
            }
        }
    }

    async fn publish_operation(&self, doc_id: &DocumentId, frame: String) {
        if let Err(e) = self.broker.publish(&doc_id.channel(), frame).await {
            log::error!("Relay failed to publish on {doc_id}: {e}");
        }
    }

    /// Record a client's presence and announce the document's live users
    /// locally and on the broker.
    pub async fn publish_presence(&self, doc_id: &DocumentId, hub: &Hub, frame: &PresenceFrame) {
        self.presence.touch(doc_id, &frame.client_id, &frame.username);
        self.announce_presence(doc_id, hub).await;
    }

    /// Fold in a `presence_update` sent over a client connection (an agent's
    /// upstream link) and announce it if anything changed.
    pub async fn merge_presence(
        &self,
        doc_id: &DocumentId,
        hub: &Hub,
        users: &BTreeMap<String, String>,
    ) {
        if self.presence.merge(doc_id, users, Origin::Local) {
            self.announce_presence(doc_id, hub).await;
        }
    }

    /// Forget a disconnected client and announce the change.
    pub async fn remove_presence(&self, doc_id: &DocumentId, hub: &Hub, client_id: &str) {
        if self.presence.remove(doc_id, client_id) {
            self.announce_presence(doc_id, hub).await;
        }
    }

    /// Show every live user locally; publish only the ones owned here.
    async fn announce_presence(&self, doc_id: &DocumentId, hub: &Hub) {
        self.broadcast_presence(doc_id, hub);
        let Some(frame) = encode_presence(doc_id, self.presence.local_users(doc_id)) else {
            return;
        };
        if let Err(e) = self.broker.publish(&doc_id.channel(), frame).await {
            log::warn!("Relay failed to publish presence on {doc_id}: {e}");
        }
    }

    fn broadcast_presence(&self, doc_id: &DocumentId, hub: &Hub) {
        let Some(frame) = encode_presence(doc_id, self.presence.users(doc_id)) else {
            return;
        };
        if let Err(e) = hub.broadcast(frame) {
            log::warn!("Presence fan-out failed on {doc_id}: {e}");
        }
    }
}

fn encode_presence(doc_id: &DocumentId, users: BTreeMap<String, String>) -> Option<String> {
    match Message::presence_update(users).encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode presence for {doc_id}: {e}");
            None
        }
    }
}
