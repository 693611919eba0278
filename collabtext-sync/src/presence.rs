//! Ephemeral "who is here" state per document.
//!
//! Not part of the CRDT: entries expire after a short TTL unless refreshed,
//! and losing them is harmless. Expired entries are pruned lazily whenever a
//! document's users are read.
//!
//! Entries learned from the broker are [`Origin::Relayed`]. They are shown
//! to local editors but never published again, so a user lives only as long
//! as the process that owns them keeps announcing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::coordinator::DocumentId;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long an entry lives without a refresh (default: 10s)
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
        }
    }
}

/// Where a presence entry was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client of this process, or an agent linked to it
    Local,
    /// Another process, via the broker
    Relayed,
}

#[derive(Debug, Clone)]
struct Entry {
    username: String,
    seen: Instant,
    origin: Origin,
}

/// `(document, client) → username` with expiry.
pub struct PresenceStore {
    ttl: Duration,
    docs: Mutex<HashMap<DocumentId, HashMap<String, Entry>>>,
}

impl PresenceStore {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            ttl: config.ttl,
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// Record or refresh one client.
    pub fn touch(&self, doc_id: &DocumentId, client_id: &str, username: &str) {
        if let Ok(mut docs) = self.docs.lock() {
            docs.entry(doc_id.clone()).or_default().insert(
                client_id.to_string(),
                Entry {
                    username: username.to_string(),
                    seen: Instant::now(),
                    origin: Origin::Local,
                },
            );
        }
    }

    /// Fold in a user list reported from `origin`, refreshing every entry
    /// it names. A relayed report never takes over a live local entry.
    /// Returns whether any user was added or renamed.
    pub fn merge(
        &self,
        doc_id: &DocumentId,
        users: &BTreeMap<String, String>,
        origin: Origin,
    ) -> bool {
        let Ok(mut docs) = self.docs.lock() else {
            return false;
        };
        let now = Instant::now();
        let ttl = self.ttl;
        let entries = docs.entry(doc_id.clone()).or_default();
        let mut changed = false;
        for (client_id, username) in users {
            let live = entries.get(client_id).filter(|e| e.seen.elapsed() <= ttl);
            if origin == Origin::Relayed && live.is_some_and(|e| e.origin == Origin::Local) {
                continue;
            }
            changed |= !live.is_some_and(|e| &e.username == username);
            entries.insert(
                client_id.clone(),
                Entry {
                    username: username.clone(),
                    seen: now,
                    origin,
                },
            );
        }
        changed
    }

    /// Forget one client. Returns whether it was present.
    pub fn remove(&self, doc_id: &DocumentId, client_id: &str) -> bool {
        let Ok(mut docs) = self.docs.lock() else {
            return false;
        };
        let removed = docs
            .get_mut(doc_id)
            .is_some_and(|entries| entries.remove(client_id).is_some());
        if docs.get(doc_id).is_some_and(|entries| entries.is_empty()) {
            docs.remove(doc_id);
        }
        removed
    }

    /// Live users of a document, pruning expired ones.
    pub fn users(&self, doc_id: &DocumentId) -> BTreeMap<String, String> {
        self.live(doc_id, |_| true)
    }

    /// Live users this process announces on the broker.
    pub fn local_users(&self, doc_id: &DocumentId) -> BTreeMap<String, String> {
        self.live(doc_id, |e| e.origin == Origin::Local)
    }

    fn live(&self, doc_id: &DocumentId, keep: impl Fn(&Entry) -> bool) -> BTreeMap<String, String> {
        let Ok(mut docs) = self.docs.lock() else {
            return BTreeMap::new();
        };
        let ttl = self.ttl;
        let Some(entries) = docs.get_mut(doc_id) else {
            return BTreeMap::new();
        };
        entries.retain(|_, e| e.seen.elapsed() <= ttl);
        let users = entries
            .iter()
            .filter(|(_, e)| keep(e))
            .map(|(id, e)| (id.clone(), e.username.clone()))
            .collect();
        if entries.is_empty() {
            docs.remove(doc_id);
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::parse("doc").unwrap()
    }

    #[test]
    fn test_touch_and_list() {
        let store = PresenceStore::new(PresenceConfig::default());
        store.touch(&doc(), "c1", "ada");
        store.touch(&doc(), "c2", "grace");
        store.touch(&doc(), "c1", "ada l.");

        let users = store.users(&doc());
        assert_eq!(users.len(), 2);
        assert_eq!(users["c1"], "ada l.");
    }

    #[test]
    fn test_entries_expire() {
        let store = PresenceStore::new(PresenceConfig {
            ttl: Duration::from_millis(20),
        });
        store.touch(&doc(), "c1", "ada");
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.users(&doc()).is_empty());
    }

    #[test]
    fn test_merge_reports_changes_only() {
        let store = PresenceStore::new(PresenceConfig::default());
        let mut users = BTreeMap::new();
        users.insert("c9".to_string(), "lin".to_string());

        assert!(store.merge(&doc(), &users, Origin::Relayed));
        assert!(!store.merge(&doc(), &users, Origin::Relayed));

        users.insert("c9".to_string(), "lin w.".to_string());
        assert!(store.merge(&doc(), &users, Origin::Relayed));
        assert_eq!(store.users(&doc())["c9"], "lin w.");
    }

    #[test]
    fn test_relayed_entries_not_republished() {
        let store = PresenceStore::new(PresenceConfig::default());
        store.touch(&doc(), "c1", "ada");
        let mut remote = BTreeMap::new();
        remote.insert("c1".to_string(), "impostor".to_string());
        remote.insert("c2".to_string(), "grace".to_string());

        assert!(store.merge(&doc(), &remote, Origin::Relayed));
        let users = store.users(&doc());
        assert_eq!(users.len(), 2);
        assert_eq!(users["c1"], "ada");

        let local = store.local_users(&doc());
        assert_eq!(local.len(), 1);
        assert_eq!(local["c1"], "ada");
    }

    #[test]
    fn test_relayed_entry_expires_once_owner_stops() {
        let store = PresenceStore::new(PresenceConfig {
            ttl: Duration::from_millis(30),
        });
        let mut remote = BTreeMap::new();
        remote.insert("ghost".to_string(), "lin".to_string());
        store.merge(&doc(), &remote, Origin::Relayed);

        // Our own snapshots echoed back carry no relayed users.
        store.touch(&doc(), "c1", "ada");
        let echo = store.local_users(&doc());
        assert!(!store.merge(&doc(), &echo, Origin::Relayed));

        std::thread::sleep(Duration::from_millis(50));
        store.touch(&doc(), "c1", "ada");
        let users = store.users(&doc());
        assert!(!users.contains_key("ghost"));
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn test_remove() {
        let store = PresenceStore::new(PresenceConfig::default());
        store.touch(&doc(), "c1", "ada");
        assert!(store.remove(&doc(), "c1"));
        assert!(!store.remove(&doc(), "c1"));
        assert!(store.users(&doc()).is_empty());
    }
}
