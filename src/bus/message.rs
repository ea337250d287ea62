//! Wire types for the invalidation bus.
//!
//! Everything on the wire is JSON. A change message carries the changed key,
//! the walk so far (`parents`), and a unix-millisecond mtime; binary payloads
//! ride along base64-encoded. Join/leave control frames reuse the exact same
//! socket, distinguished by shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::store::resource::now_millis;

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Put,
    Delete,
}

/// A resource-change announcement.
///
/// `parents` accumulates as the message is re-emitted up the dependency
/// chain; its last element is the most recently invalidated key and names the
/// room the next hop broadcasts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub key: String,
    pub method: Method,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub data: Option<Bytes>,
}

impl ChangeMessage {
    pub fn put(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            method: Method::Put,
            mtime: now_millis(),
            parents: Vec::new(),
            data: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            ..Self::put(key)
        }
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    /// The key whose parents the next hop walks, and the targeted room name:
    /// the last walked parent, or the originating key on the first hop.
    pub fn target(&self) -> &str {
        self.parents.last().map(String::as_str).unwrap_or(&self.key)
    }

    /// Derive the next hop's message: a copy with the walk extended by
    /// `parent`.
    pub fn child(&self, parent: &str) -> Self {
        let mut msg = self.clone();
        msg.parents.push(parent.to_string());
        msg
    }
}

/// Join a room, asking for a replay of everything newer than `mtime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinFrame {
    pub room: String,
    pub mtime: i64,
}

/// Leave a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveFrame {
    pub room: String,
}

/// Anything a connection may send to the server. Shapes are disjoint: a
/// change message carries `key`/`method`, a join carries `room` + `mtime`,
/// a leave only `room`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Message(ChangeMessage),
    Join(JoinFrame),
    Leave(LeaveFrame),
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Bytes>, ser: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => ser.serialize_some(&STANDARD.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(de)?;
        encoded
            .map(|text| {
                STANDARD
                    .decode(text.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_matches_contract() {
        let msg = ChangeMessage::put("http://x/b").with_mtime(100);
        let json = serde_json::to_value(&msg).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({"key": "http://x/b", "method": "put", "mtime": 100})
        );

        let mut msg = msg;
        msg.parents.push("http://x/a".into());
        let json = serde_json::to_value(&msg).expect("encode");
        assert_eq!(json["parents"], serde_json::json!(["http://x/a"]));
    }

    #[test]
    fn data_rides_base64() {
        let mut msg = ChangeMessage::put("k").with_mtime(1);
        msg.data = Some(Bytes::from_static(b"\x00\x01binary"));

        let text = serde_json::to_string(&msg).expect("encode");
        let back: ChangeMessage = serde_json::from_str(&text).expect("decode");
        assert_eq!(back.data, msg.data);
    }

    #[test]
    fn target_is_last_parent_or_key() {
        let mut msg = ChangeMessage::put("http://x/c").with_mtime(1);
        assert_eq!(msg.target(), "http://x/c");
        msg.parents.push("http://x/b".into());
        assert_eq!(msg.target(), "http://x/b");
    }

    #[test]
    fn child_extends_walk() {
        let msg = ChangeMessage::put("http://x/c").with_mtime(7);

        let next = msg.child("http://x/b").child("http://x/a");
        assert_eq!(next.key, "http://x/c");
        assert_eq!(next.mtime, 7);
        assert_eq!(next.parents, vec!["http://x/b", "http://x/a"]);
    }

    #[test]
    fn client_frames_disambiguate_by_shape() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"key":"k","method":"put","mtime":1}"#).expect("msg");
        assert!(matches!(frame, ClientFrame::Message(_)));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"room":"*","mtime":0}"#).expect("join");
        assert!(matches!(frame, ClientFrame::Join(_)));

        let frame: ClientFrame = serde_json::from_str(r#"{"room":"*"}"#).expect("leave");
        assert!(matches!(frame, ClientFrame::Leave(_)));
    }

    #[test]
    fn missing_parents_defaults_empty() {
        let msg: ChangeMessage =
            serde_json::from_str(r#"{"key":"k","method":"delete","mtime":5}"#).expect("decode");
        assert_eq!(msg.method, Method::Delete);
        assert!(msg.parents.is_empty());
    }
}
