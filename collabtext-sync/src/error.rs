use collabtext_core::{ProtocolError, SequenceError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::broker::BrokerError;
use crate::storage::StoreError;

/// Errors surfaced by the sync service.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("hub for {0} has shut down")]
    HubClosed(String),
}
