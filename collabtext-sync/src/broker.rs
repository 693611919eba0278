//! Publish/subscribe collaborators used by the relay.
//!
//! ```text
//!  LocalBroker     channel ──► tokio broadcast ──► Subscription (per subscriber)
//!
//!  UpstreamBroker  channel "updates:{doc}" ──► ws://central/ws/{doc}?token=…
//!                  publish  → frame on the link
//!                  subscribe→ frames received on the link
//! ```
//!
//! A [`Subscription`] ends when the broker side goes away. Nothing is
//! buffered for a subscriber that is not connected.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Per-subscription buffer between the broker side and the relay.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Default bound on opening an upstream link.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker disconnected")]
    Disconnected,
    #[error("failed to reach broker at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("invalid channel {0:?}")]
    InvalidChannel(String),
}

/// Stream of payloads published on one channel.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next payload, or `None` once the broker side has gone away.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

// ─── LocalBroker ──────────────────────────────────────────────────

/// In-process pub/sub. Several servers in one process (or one test) can
/// share it to observe each other's operations.
pub struct LocalBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
    available: AtomicBool,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    /// Drop every channel, ending all current subscriptions.
    pub fn disconnect_all(&self) {
        if let Ok(mut channels) = self.channels.lock() {
            log::info!("Local broker dropping {} channels", channels.len());
            channels.clear();
        }
    }

    /// While unavailable, publish and subscribe fail with
    /// [`BrokerError::Disconnected`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.disconnect_all();
        }
    }

    /// Live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(channel).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        self.check_available()?;
        let sender = {
            let channels = self.channels.lock().map_err(|_| BrokerError::Disconnected)?;
            channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // No receivers is not an error: nobody is listening yet.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        self.check_available()?;
        let mut source = {
            let mut channels = self.channels.lock().map_err(|_| BrokerError::Disconnected)?;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber on {channel} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::debug!("Local subscription on {channel} ended");
        });

        Ok(Subscription::new(rx))
    }
}

// ─── UpstreamBroker ───────────────────────────────────────────────

/// WebSocket link from an editing agent to a central server, one link per
/// document channel.
pub struct UpstreamBroker {
    base_url: String,
    token: Option<String>,
    connect_timeout: Duration,
    links: Arc<tokio::sync::Mutex<HashMap<String, mpsc::Sender<String>>>>,
}

impl UpstreamBroker {
    /// `base_url` is the central server's WebSocket root, e.g.
    /// `ws://localhost:8081/ws`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            links: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Bound on the TCP connect plus WebSocket handshake of one link.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// URL of the central endpoint for `channel`.
    pub fn url_for(&self, channel: &str) -> Result<String, BrokerError> {
        let doc = channel
            .strip_prefix("updates:")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| BrokerError::InvalidChannel(channel.to_string()))?;
        Ok(match &self.token {
            Some(token) => format!("{}/{doc}?token={token}", self.base_url),
            None => format!("{}/{doc}", self.base_url),
        })
    }

    pub async fn is_linked(&self, channel: &str) -> bool {
        self.links
            .lock()
            .await
            .get(channel)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Broker for UpstreamBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let link = self.links.lock().await.get(channel).cloned();
        match link {
            Some(tx) => tx.send(payload).await.map_err(|_| BrokerError::Disconnected),
            None => Err(BrokerError::Disconnected),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let url = self.url_for(channel)?;
        let connect = tokio_tungstenite::connect_async(url.clone());
        let (ws_stream, _) = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                return Err(BrokerError::Connect {
                    url,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(BrokerError::Connect {
                    url,
                    reason: format!("no handshake within {:?}", self.connect_timeout),
                })
            }
        };
        log::info!("Linked {channel} to upstream {}", self.base_url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(SUBSCRIPTION_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(SUBSCRIPTION_BUFFER);

        // Replacing an old sender ends that link's writer.
        self.links
            .lock()
            .await
            .insert(channel.to_string(), out_tx.clone());

        // Writer task: forward published payloads to the link.
        tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: frames from the central server become the subscription.
        let channel = channel.to_string();
        let links = self.links.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Upstream link for {channel} failed: {e}");
                        break;
                    }
                }
            }
            let mut links = links.lock().await;
            if links.get(&channel).is_some_and(|tx| tx.same_channel(&out_tx)) {
                links.remove(&channel);
            }
            log::info!("Upstream link for {channel} closed");
        });

        Ok(Subscription::new(in_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn next(sub: &mut Subscription) -> Option<String> {
        timeout(Duration::from_secs(1), sub.next()).await.unwrap()
    }

    #[tokio::test]
    async fn test_local_publish_reaches_every_subscriber() {
        let broker = LocalBroker::default();
        let mut a = broker.subscribe("updates:d").await.unwrap();
        let mut b = broker.subscribe("updates:d").await.unwrap();
        let mut other = broker.subscribe("updates:e").await.unwrap();

        broker.publish("updates:d", "op".into()).await.unwrap();
        assert_eq!(next(&mut a).await.as_deref(), Some("op"));
        assert_eq!(next(&mut b).await.as_deref(), Some("op"));
        assert!(timeout(Duration::from_millis(50), other.next()).await.is_err());
        assert_eq!(broker.subscriber_count("updates:d"), 2);
    }

    #[tokio::test]
    async fn test_local_publish_without_subscribers() {
        let broker = LocalBroker::default();
        assert!(broker.publish("updates:nobody", "x".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_disconnect_ends_subscriptions() {
        let broker = LocalBroker::default();
        let mut sub = broker.subscribe("updates:d").await.unwrap();
        broker.disconnect_all();
        assert_eq!(next(&mut sub).await, None);

        // Resubscribing after a drop works and sees new traffic.
        let mut again = broker.subscribe("updates:d").await.unwrap();
        broker.publish("updates:d", "after".into()).await.unwrap();
        assert_eq!(next(&mut again).await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_local_unavailable() {
        let broker = LocalBroker::default();
        broker.set_available(false);
        assert!(matches!(
            broker.publish("updates:d", "x".into()).await,
            Err(BrokerError::Disconnected)
        ));
        assert!(broker.subscribe("updates:d").await.is_err());
        broker.set_available(true);
        assert!(broker.subscribe("updates:d").await.is_ok());
    }

    #[test]
    fn test_upstream_url() {
        let broker = UpstreamBroker::new("ws://central:8081/ws/", Some("secret".into()));
        assert_eq!(
            broker.url_for("updates:notes").unwrap(),
            "ws://central:8081/ws/notes?token=secret"
        );
        assert!(broker.url_for("notes").is_err());

        let open = UpstreamBroker::new("ws://central:8081/ws", None);
        assert_eq!(open.url_for("updates:n").unwrap(), "ws://central:8081/ws/n");
    }

    #[tokio::test]
    async fn test_upstream_publish_without_link() {
        let broker = UpstreamBroker::new("ws://127.0.0.1:9/ws", None);
        assert!(matches!(
            broker.publish("updates:d", "x".into()).await,
            Err(BrokerError::Disconnected)
        ));
        assert!(matches!(
            broker.subscribe("updates:d").await,
            Err(BrokerError::Connect { .. })
        ));
        assert!(!broker.is_linked("updates:d").await);
    }

    #[tokio::test]
    async fn test_upstream_connect_times_out() {
        // Accepts TCP but never answers the WebSocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let broker = UpstreamBroker::new(format!("ws://{addr}/ws"), None)
            .with_connect_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let result = timeout(Duration::from_secs(2), broker.subscribe("updates:d"))
            .await
            .expect("subscribe hung past its connect timeout");
        assert!(matches!(result, Err(BrokerError::Connect { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!broker.is_linked("updates:d").await);
    }
}
