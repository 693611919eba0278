//! Connection routing and credentials, checked during the WebSocket
//! handshake before any document state is touched.
//!
//! ```text
//!  GET /ws                 → default document
//!  GET /ws/{documentID}    → that document
//!  ?token=…                → TokenAuthority ─► user | 403
//!  anything else           → 404
//! ```

use std::collections::HashMap;
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::coordinator::DocumentId;
use crate::error::SyncError;

/// Resolves a connection's credential to a user identity.
pub trait TokenAuthority: Send + Sync {
    /// The user behind `token`, or `None` to refuse the upgrade.
    fn authenticate(&self, token: Option<&str>) -> Option<String>;
}

/// Accept every connection, with or without a token.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl TokenAuthority for AllowAll {
    fn authenticate(&self, _token: Option<&str>) -> Option<String> {
        Some("anonymous".to_string())
    }
}

/// Fixed token → user table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    users: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.users.insert(token.into(), user.into());
        self
    }

    /// Parse `TOKEN=USER` entries.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            match entry.split_once('=') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    tokens.users.insert(token.to_string(), user.to_string());
                }
                _ => {
                    return Err(SyncError::Config(format!(
                        "token entry {entry:?} is not TOKEN=USER"
                    )))
                }
            }
        }
        Ok(tokens)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl TokenAuthority for StaticTokens {
    fn authenticate(&self, token: Option<&str>) -> Option<String> {
        token.and_then(|t| self.users.get(t).cloned())
    }
}

/// Where an accepted connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub doc_id: DocumentId,
    pub user: String,
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    NotFound,
    BadDocument(String),
    Forbidden,
}

impl Refusal {
    pub fn status(&self) -> StatusCode {
        match self {
            Refusal::NotFound => StatusCode::NOT_FOUND,
            Refusal::BadDocument(_) => StatusCode::BAD_REQUEST,
            Refusal::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    /// HTTP response that ends the handshake.
    pub fn into_response(self) -> ErrorResponse {
        let body = match &self {
            Refusal::NotFound => "not found".to_string(),
            Refusal::BadDocument(id) => format!("invalid document id {id:?}"),
            Refusal::Forbidden => "forbidden".to_string(),
        };
        let mut response = ErrorResponse::new(Some(body));
        *response.status_mut() = self.status();
        response
    }
}

/// Route a handshake request from its path and query string.
pub fn resolve_route(
    path: &str,
    query: Option<&str>,
    default_document: &DocumentId,
    auth: &dyn TokenAuthority,
) -> Result<Route, Refusal> {
    let doc_id = match path.trim_end_matches('/') {
        "/ws" => default_document.clone(),
        rest => {
            let raw = rest.strip_prefix("/ws/").ok_or(Refusal::NotFound)?;
            if raw.contains('/') {
                return Err(Refusal::NotFound);
            }
            DocumentId::parse(raw).map_err(|_| Refusal::BadDocument(raw.to_string()))?
        }
    };

    let token = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value)
    });
    let user = auth.authenticate(token).ok_or(Refusal::Forbidden)?;

    Ok(Route { doc_id, user })
}
