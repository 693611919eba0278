//! WebSocket sync server with per-document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws/{doc}?token=…
//!            ├── handshake (route + TokenAuthority) ── DocumentRegistry
//! Client B ──┘                                              │
//!                                                     DocumentRoom (doc)
//!                                                     ├── DocumentCoordinator ── dyn DocumentPersistence
//!                                                     ├── Hub ──► mailbox per connection
//!                                                     └── Relay subscription ◄──► dyn Broker
//! ```
//!
//! Each connection gets one `load` frame, then a loop over its inbound frames
//! and its hub mailbox. The same server runs as the central authority
//! (static tokens, in-process broker) or as an editing agent (no auth,
//! upstream link to a central server as its broker).

use collabtext_core::Message;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{resolve_route, Route, TokenAuthority};
use crate::broker::Broker;
use crate::coordinator::{CoordinatorConfig, DocumentId};
use crate::error::SyncError;
use crate::hub::{Payload, DEFAULT_MAILBOX_CAPACITY};
use crate::presence::PresenceConfig;
use crate::registry::{DocumentRegistry, DocumentRoom};
use crate::relay::{Relay, RelayConfig};
use crate::storage::{DocumentPersistence, DocumentStore, MemoryStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document served on a bare `/ws`
    pub default_document: String,
    /// Hub mailbox capacity per connection
    pub mailbox_capacity: usize,
    /// How long an unattended document stays open
    pub eviction_hold: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
    pub relay: RelayConfig,
    pub presence: PresenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
            default_document: "default_doc".to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            eviction_hold: Duration::from_secs(30),
            storage_path: None,
            coordinator: CoordinatorConfig::default(),
            relay: RelayConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loopback on an ephemeral port with short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            eviction_hold: Duration::from_millis(50),
            coordinator: CoordinatorConfig {
                save_debounce: Duration::from_millis(20),
                ..CoordinatorConfig::default()
            },
            relay: RelayConfig {
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(200),
                ready_timeout: Duration::from_millis(500),
            },
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    refused_connections: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
}

struct ServerState {
    config: ServerConfig,
    default_document: DocumentId,
    registry: Arc<DocumentRegistry>,
    auth: Arc<dyn TokenAuthority>,
    stats: AtomicServerStats,
}

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    state: Arc<ServerState>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentPersistence>,
        broker: Arc<dyn Broker>,
        auth: Arc<dyn TokenAuthority>,
    ) -> Result<Self, SyncError> {
        let default_document = DocumentId::parse(&config.default_document)?;
        let relay = Arc::new(Relay::new(broker, config.relay.clone(), config.presence.clone()));
        let registry = Arc::new(DocumentRegistry::new(
            store,
            config.coordinator.clone(),
            config.mailbox_capacity,
            relay,
        ));
        Ok(Self {
            state: Arc::new(ServerState {
                config,
                default_document,
                registry,
                auth,
                stats: AtomicServerStats::default(),
            }),
        })
    }

    /// Open the store named by `config.storage_path` (RocksDB) or fall back
    /// to memory.
    pub fn open(
        config: ServerConfig,
        broker: Arc<dyn Broker>,
        auth: Arc<dyn TokenAuthority>,
    ) -> Result<Self, SyncError> {
        let store: Arc<dyn DocumentPersistence> = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig::at(path.clone()))?;
                log::info!("Storing documents in {}", path.display());
                Arc::new(store)
            }
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Self::new(config, store, broker, auth)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.state.registry
    }

    pub fn stats(&self) -> ServerStats {
        let s = &self.state.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            refused_connections: s.refused_connections.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            malformed_frames: s.malformed_frames.load(Ordering::Relaxed),
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let state = &self.state;
        let mut route: Option<Route> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let uri = req.uri();
            match resolve_route(
                uri.path(),
                uri.query(),
                &state.default_document,
                state.auth.as_ref(),
            ) {
                Ok(r) => {
                    route = Some(r);
                    Ok(resp)
                }
                Err(refusal) => {
                    log::warn!("Refusing {addr} on {}: {refusal:?}", uri.path());
                    state.stats.refused_connections.fetch_add(1, Ordering::Relaxed);
                    Err(refusal.into_response())
                }
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        let (ws_stream, route) = match (handshake, route) {
            (Ok(ws), Some(route)) => (ws, route),
            (Ok(_), None) => return Ok(()),
            (Err(e), None) => {
                log::debug!("Handshake with {addr} ended without a route: {e}");
                return Ok(());
            }
            (Err(e), Some(_)) => return Err(e.into()),
        };
        log::info!("{} connected from {addr} to {}", route.user, route.doc_id);

        state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        state.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let result = self.session(ws_stream, &route).await;
        state.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        log::info!("{} disconnected from {}", route.user, route.doc_id);
        result
    }

    /// Attach to the document, pump frames, then detach whatever the outcome.
    async fn session(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        route: &Route,
    ) -> Result<(), SyncError> {
        let registry = &self.state.registry;
        let room = registry.open_session(&route.doc_id).await?;
        if !room.relay_ready().await {
            log::warn!("Serving {} before its relay subscription is up", route.doc_id);
        }

        let mut clients = BTreeSet::new();
        let result = match room.hub.register() {
            Ok((consumer, mailbox)) => {
                let result = self.pump(ws_stream, &room, mailbox, &mut clients).await;
                room.hub.unregister(consumer);
                result
            }
            Err(e) => Err(e),
        };

        for client_id in &clients {
            registry
                .relay()
                .remove_presence(room.id(), &room.hub, client_id)
                .await;
        }

        if registry.close_session(&room) == 0 {
            let registry = registry.clone();
            let doc_id = route.doc_id.clone();
            let hold = self.state.config.eviction_hold;
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                registry.evict_if_idle(&doc_id).await;
            });
        }

        result
    }

    async fn pump(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        room: &DocumentRoom,
        mut mailbox: mpsc::Receiver<Payload>,
        clients: &mut BTreeSet<String>,
    ) -> Result<(), SyncError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Registered first, so nothing committed after this snapshot is missed.
        let load = room.coordinator.load_message().await.encode()?;
        ws_sender.send(WsMessage::Text(load.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_frame(room, text.as_str(), clients).await;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Read error on {}: {e}", room.id());
                            break;
                        }
                    }
                }

                out = mailbox.recv() => {
                    match out {
                        Some(payload) => {
                            ws_sender.send(WsMessage::Text(payload.to_string().into())).await?;
                        }
                        None => {
                            // The hub dropped this consumer for falling behind.
                            log::warn!("Closing slow connection on {}", room.id());
                            break;
                        }
                    }
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Apply one inbound frame. Malformed or unexpected frames are logged
    /// and skipped; the connection stays open.
    async fn handle_frame(&self, room: &DocumentRoom, text: &str, clients: &mut BTreeSet<String>) {
        let stats = &self.state.stats;
        let relay = self.state.registry.relay();
        let doc_id = room.id();
        stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let msg = match Message::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping frame on {doc_id}: {e}");
                return;
            }
        };

        match msg {
            Message::RawInsert(_) | Message::RawDelete(_) => {
                let Some((intent, client_id)) = msg.into_intent() else {
                    return;
                };
                room.commit_intent(intent, client_id).await;
            }
            Message::CrdtInsert(_) | Message::CrdtDelete(_) => {
                let Some((op, _)) = msg.into_operation() else {
                    return;
                };
                room.commit_remote(&op, text).await;
            }
            Message::Presence(frame) => {
                clients.insert(frame.client_id.clone());
                relay.publish_presence(doc_id, &room.hub, &frame).await;
            }
            Message::PresenceUpdate { users } => {
                relay.merge_presence(doc_id, &room.hub, &users).await;
            }
            other => {
                log::debug!("Ignoring {} from a client on {doc_id}", other.action());
            }
        }
    }
}
