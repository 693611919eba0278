//! # collabtext-sync — Coordination, fan-out and relay for collabtext documents
//!
//! Serves the sequence CRDT from `collabtext-core` to WebSocket editors and
//! keeps several processes converged through a pub/sub broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   raw_* / crdt_*   ┌──────────────────────┐
//! │ Editor      │ ◄────────────────► │ SyncServer           │
//! │ (browser)   │      JSON text     │  ├─ DocumentRegistry │
//! └─────────────┘                    │  │   └─ DocumentRoom │
//!                                    │  │      ├─ Coordinator ── Store
//!                                    │  │      ├─ Hub        │
//!                                    │  │      └─ Relay ─────┼──► Broker
//!                                    └──────────────────────┘     │
//!                                                                 ▼
//!                                             other servers / central server
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`] — Per-document sequence owner, debounced persistence
//! - [`registry`] — Open documents, load-or-create and idle eviction
//! - [`hub`] — Non-blocking local fan-out with slow-consumer eviction
//! - [`relay`] — Broker bridge with reconnect backoff
//! - [`broker`] — In-process and upstream WebSocket brokers
//! - [`presence`] — Ephemeral per-document user list
//! - [`auth`] — Handshake routing and tokens
//! - [`server`] — WebSocket server
//! - [`storage`] — RocksDB and in-memory snapshot stores

pub mod auth;
pub mod broker;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{resolve_route, AllowAll, Refusal, Route, StaticTokens, TokenAuthority};
pub use broker::{
    Broker, BrokerError, LocalBroker, Subscription, UpstreamBroker, DEFAULT_CONNECT_TIMEOUT,
};
pub use coordinator::{CoordinatorConfig, DocumentCoordinator, DocumentId, CLOCK_RESERVATION};
pub use error::SyncError;
pub use hub::{ConsumerId, Hub, HubStats, Payload, DEFAULT_MAILBOX_CAPACITY};
pub use presence::{Origin, PresenceConfig, PresenceStore};
pub use registry::{DocumentRegistry, DocumentRoom};
pub use relay::{Relay, RelayConfig, RelayHandle};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, DocumentPersistence, DocumentStore, MemoryStore, StoreConfig, StoreError,
};
