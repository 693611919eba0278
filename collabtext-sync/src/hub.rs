//! Fan-out of encoded frames to every locally connected consumer of one
//! document.
//!
//! ```text
//!  register ───┐
//!  unregister ─┼──► mpsc ──► control loop (owns HashMap<ConsumerId, Sender>)
//!  broadcast ──┘                  │ try_send
//!                    ┌────────────┼────────────┐
//!                    ▼            ▼            ▼
//!                 mailbox      mailbox      mailbox (full → dropped)
//! ```
//!
//! Membership is only touched by the control loop, so no lock guards it.
//! A consumer whose mailbox is full or closed is unregistered on the spot;
//! dropping its sender ends its receive loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SyncError;

/// Encoded frame shared by every mailbox it is delivered to.
pub type Payload = Arc<str>;

/// Default mailbox capacity per consumer.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Opaque handle of a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Frames enqueued into a mailbox
    pub messages_sent: u64,
    /// Consumers removed because their mailbox was full or closed
    pub consumers_dropped: u64,
    pub active_consumers: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_sent: AtomicU64,
    consumers_dropped: AtomicU64,
    active_consumers: AtomicUsize,
}

enum Command {
    Register {
        id: ConsumerId,
        mailbox: mpsc::Sender<Payload>,
    },
    Unregister(ConsumerId),
    Broadcast(Payload),
}

/// Local fan-out hub for one document.
pub struct Hub {
    label: String,
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    mailbox_capacity: usize,
    stats: Arc<AtomicHubStats>,
}

impl Hub {
    /// Spawn the control loop on the current runtime.
    pub fn spawn(label: impl Into<String>, mailbox_capacity: usize) -> Self {
        let label = label.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicHubStats::default());
        tokio::spawn(control_loop(label.clone(), rx, stats.clone()));
        Self {
            label,
            commands,
            next_id: AtomicU64::new(1),
            mailbox_capacity: mailbox_capacity.max(1),
            stats,
        }
    }

    /// Add a consumer. Frames broadcast after this call reach the returned
    /// mailbox.
    pub fn register(&self) -> Result<(ConsumerId, mpsc::Receiver<Payload>), SyncError> {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        self.send(Command::Register { id, mailbox: tx })?;
        self.stats.active_consumers.fetch_add(1, Ordering::SeqCst);
        Ok((id, rx))
    }

    /// Remove a consumer and close its mailbox. Unknown ids are ignored.
    pub fn unregister(&self, id: ConsumerId) {
        // The loop only stops once the hub is gone.
        let _ = self.send(Command::Unregister(id));
    }

    /// Enqueue `payload` for every consumer without waiting on any of them.
    pub fn broadcast(&self, payload: impl Into<Payload>) -> Result<(), SyncError> {
        self.send(Command::Broadcast(payload.into()))
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            consumers_dropped: self.stats.consumers_dropped.load(Ordering::Relaxed),
            active_consumers: self.consumer_count(),
        }
    }

    /// Registered consumers, counting registrations the loop has not seen yet.
    pub fn consumer_count(&self) -> usize {
        self.stats.active_consumers.load(Ordering::SeqCst)
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::HubClosed(self.label.clone()))
    }
}

async fn control_loop(
    label: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stats: Arc<AtomicHubStats>,
) {
    let mut members: HashMap<ConsumerId, mpsc::Sender<Payload>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { id, mailbox } => {
                members.insert(id, mailbox);
                log::debug!("Hub {label}: {id} registered ({} members)", members.len());
            }
            Command::Unregister(id) => {
                if members.remove(&id).is_some() {
                    stats.active_consumers.fetch_sub(1, Ordering::SeqCst);
                    log::debug!("Hub {label}: {id} unregistered ({} members)", members.len());
                }
            }
            Command::Broadcast(payload) => {
                let mut dropped = Vec::new();
                for (id, mailbox) in &members {
                    match mailbox.try_send(payload.clone()) {
                        Ok(()) => {
                            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Full(_)) => {
                            log::warn!("Hub {label}: dropping slow consumer {id}");
                            dropped.push(*id);
                        }
                        Err(TrySendError::Closed(_)) => dropped.push(*id),
                    }
                }
                for id in dropped {
                    stats.consumers_dropped.fetch_add(1, Ordering::Relaxed);
                    stats.active_consumers.fetch_sub(1, Ordering::SeqCst);
                    members.remove(&id);
                }
            }
        }
    }

    log::debug!("Hub {label} stopped");
}
