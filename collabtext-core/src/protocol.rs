//! JSON wire format shared by clients, agents and the central server.
//!
//! Every frame is an object tagged by `action`:
//! ```text
//! { "action": "raw_insert" | "raw_delete" | "crdt_insert" | "crdt_delete",
//!   "char":   { "id": { "clock": 3, "peerID": "…" }, "value": "H", "position": [5] },
//!   "index":  0,          // raw_* only, visible index
//!   "clientID": "…" }     // originating connection
//!
//! { "action": "presence", "clientID": "…", "username": "…" }
//! { "action": "presence_update", "users": { "<clientID>": "<username>" } }
//! { "action": "load", "doc": [ <Char>, … ] }
//! ```
//!
//! `raw_*` frames are edit intents from a directly-connected editor; `crdt_*`
//! frames carry final identities and positions and are applied verbatim by
//! every replica.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::sequence::{Char, Operation, Sequence};

/// Body shared by the four edit actions. Absent fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpFrame {
    #[serde(rename = "char", default)]
    pub ch: Char,
    #[serde(default)]
    pub index: i64,
    #[serde(rename = "clientID", default)]
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceFrame {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
}

/// Any frame that travels over a client connection or a broker channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Message {
    RawInsert(OpFrame),
    RawDelete(OpFrame),
    CrdtInsert(OpFrame),
    CrdtDelete(OpFrame),
    Presence(PresenceFrame),
    PresenceUpdate { users: BTreeMap<String, String> },
    Load { doc: Vec<Char> },
}

/// A user's edit, addressed by visible index (sentinels excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawIntent {
    Insert { index: i64, value: String },
    Delete { index: i64 },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Message {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Full-document snapshot sent once on connect.
    pub fn load(sequence: &Sequence) -> Self {
        Message::Load {
            doc: sequence.chars().to_vec(),
        }
    }

    pub fn presence_update(users: BTreeMap<String, String>) -> Self {
        Message::PresenceUpdate { users }
    }

    /// The edit intent carried by a `raw_*` frame, with its client id.
    pub fn into_intent(self) -> Option<(RawIntent, String)> {
        match self {
            Message::RawInsert(f) => Some((
                RawIntent::Insert {
                    index: f.index,
                    value: f.ch.value,
                },
                f.client_id,
            )),
            Message::RawDelete(f) => Some((RawIntent::Delete { index: f.index }, f.client_id)),
            _ => None,
        }
    }

    /// The replicated operation carried by a `crdt_*` frame, with its client id.
    pub fn into_operation(self) -> Option<(Operation, String)> {
        match self {
            Message::CrdtInsert(f) => Some((Operation::Insert(f.ch), f.client_id)),
            Message::CrdtDelete(f) => Some((Operation::Delete(f.ch), f.client_id)),
            _ => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Message::RawInsert(_) => "raw_insert",
            Message::RawDelete(_) => "raw_delete",
            Message::CrdtInsert(_) => "crdt_insert",
            Message::CrdtDelete(_) => "crdt_delete",
            Message::Presence(_) => "presence",
            Message::PresenceUpdate { .. } => "presence_update",
            Message::Load { .. } => "load",
        }
    }
}

impl Operation {
    /// Wrap as a `crdt_*` frame.
    pub fn to_message(&self, client_id: impl Into<String>) -> Message {
        let frame = OpFrame {
            ch: self.char().clone(),
            index: 0,
            client_id: client_id.into(),
        };
        match self {
            Operation::Insert(_) => Message::CrdtInsert(frame),
            Operation::Delete(_) => Message::CrdtDelete(frame),
        }
    }
}

impl RawIntent {
    pub fn to_message(&self, client_id: impl Into<String>) -> Message {
        let client_id = client_id.into();
        match self {
            RawIntent::Insert { index, value } => Message::RawInsert(OpFrame {
                ch: Char {
                    value: value.clone(),
                    ..Char::default()
                },
                index: *index,
                client_id,
            }),
            RawIntent::Delete { index } => Message::RawDelete(OpFrame {
                index: *index,
                client_id,
                ..OpFrame::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::CharId;
    use crate::position::Position;

    #[test]
    fn test_decode_bare_raw_delete() {
        let msg = Message::decode(r#"{"action":"raw_delete","index":3}"#).unwrap();
        let (intent, client) = msg.into_intent().unwrap();
        assert_eq!(intent, RawIntent::Delete { index: 3 });
        assert_eq!(client, "");
    }

    #[test]
    fn test_decode_raw_insert_from_editor() {
        let text = r#"{"action":"raw_insert","char":{"value":"H"},"index":0,"clientID":"tab-1"}"#;
        let (intent, client) = Message::decode(text).unwrap().into_intent().unwrap();
        assert_eq!(
            intent,
            RawIntent::Insert {
                index: 0,
                value: "H".into()
            }
        );
        assert_eq!(client, "tab-1");
    }

    #[test]
    fn test_crdt_insert_field_names() {
        let op = Operation::Insert(Char::new(CharId::new(2, "peer"), "x", Position::new(vec![4, 7])));
        let json: serde_json::Value =
            serde_json::from_str(&op.to_message("c1").encode().unwrap()).unwrap();
        assert_eq!(json["action"], "crdt_insert");
        assert_eq!(json["char"]["id"]["clock"], 2);
        assert_eq!(json["char"]["id"]["peerID"], "peer");
        assert_eq!(json["char"]["value"], "x");
        assert_eq!(json["char"]["position"], serde_json::json!([4, 7]));
        assert_eq!(json["clientID"], "c1");
    }

    #[test]
    fn test_operation_survives_wire() {
        let op = Operation::Delete(Char::new(CharId::new(5, "p"), "z", Position::new(vec![9])));
        let text = op.to_message("c").encode().unwrap();
        let (back, client) = Message::decode(&text).unwrap().into_operation().unwrap();
        assert_eq!(back, op);
        assert_eq!(client, "c");
    }

    #[test]
    fn test_presence_frames() {
        let msg = Message::decode(r#"{"action":"presence","clientID":"c9","username":"ada"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Presence(PresenceFrame {
                client_id: "c9".into(),
                username: "ada".into()
            })
        );

        let mut users = BTreeMap::new();
        users.insert("c9".to_string(), "ada".to_string());
        let text = Message::presence_update(users).encode().unwrap();
        assert_eq!(text, r#"{"action":"presence_update","users":{"c9":"ada"}}"#);
    }

    #[test]
    fn test_load_frame_contains_sentinels() {
        let text = Message::load(&Sequence::new()).encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["action"], "load");
        assert_eq!(json["doc"].as_array().unwrap().len(), 2);
        assert_eq!(json["doc"][0]["id"]["peerID"], "start");
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"action":"explode"}"#).is_err());
        assert!(Message::decode(r#"{"index":1}"#).is_err());
    }

    #[test]
    fn test_crdt_frames_are_not_intents() {
        let op = Operation::Insert(Char::new(CharId::new(1, "p"), "a", Position::new(vec![1])));
        assert!(op.to_message("c").into_intent().is_none());
        assert!(RawIntent::Delete { index: 0 }.to_message("c").into_operation().is_none());
    }
}
