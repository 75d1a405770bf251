//! Server-to-client messages and their JSON wire form.
//!
//! A `ServerMessage` is built once per event and shared (`Arc`) across every
//! destination queue. The `time` field on the wire is the send time, stamped by
//! the connection writer when the frame goes out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::{ListId, UserId};

/// Value of the `type` field of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ListUpdate,
    ItemUpdate,
    ShareUpdate,
    Notification,
    UserOnline,
    UserOffline,
    Subscribed,
    Unsubscribed,
    Pong,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListUpdate => "list_update",
            Self::ItemUpdate => "item_update",
            Self::ShareUpdate => "share_update",
            Self::Notification => "notification",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Pong => "pong",
        }
    }
}

/// A message waiting in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    pub kind: MessageKind,
    pub user_id: Option<UserId>,
    pub list_id: Option<ListId>,
    pub data: Value,
    /// When the hub accepted the message for delivery.
    pub issued_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    list_id: Option<ListId>,
    data: &'a Value,
    time: i64,
}

impl ServerMessage {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            user_id: None,
            list_id: None,
            data,
            issued_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_list(mut self, list_id: ListId) -> Self {
        self.list_id = Some(list_id);
        self
    }

    pub fn issued_at(mut self, at: DateTime<Utc>) -> Self {
        self.issued_at = at;
        self
    }

    /// Confirmation sent after a successful `subscribe`.
    pub fn subscribed(list_id: ListId) -> Self {
        Self::new(
            MessageKind::Subscribed,
            json!({ "list_id": list_id, "status": "subscribed" }),
        )
        .with_list(list_id)
    }

    /// Confirmation sent after an `unsubscribe`.
    pub fn unsubscribed(list_id: ListId) -> Self {
        Self::new(
            MessageKind::Unsubscribed,
            json!({ "list_id": list_id, "status": "unsubscribed" }),
        )
        .with_list(list_id)
    }

    /// Reply to an application-level `ping`.
    pub fn pong(now: DateTime<Utc>) -> Self {
        Self::new(MessageKind::Pong, json!({ "timestamp": now.timestamp() })).issued_at(now)
    }

    /// Serialize for the wire with `time` set to `sent_at` (unix seconds).
    pub fn to_json(&self, sent_at: DateTime<Utc>) -> serde_json::Result<String> {
        serde_json::to_string(&WireMessage {
            kind: self.kind,
            user_id: self.user_id,
            list_id: self.list_id,
            data: &self.data,
            time: sent_at.timestamp(),
        })
    }
}

/// Encode a run of queued messages into one text frame, one JSON object per
/// line, in queue order. Messages that fail to serialize are skipped.
/// Returns `None` when nothing could be encoded.
pub fn encode_batch<M>(messages: &[M], sent_at: DateTime<Utc>) -> Option<String>
where
    M: AsRef<ServerMessage>,
{
    let mut frame = String::new();
    for message in messages {
        let message = message.as_ref();
        match message.to_json(sent_at) {
            Ok(json) => {
                if !frame.is_empty() {
                    frame.push('\n');
                }
                frame.push_str(&json);
            }
            Err(e) => {
                tracing::warn!(
                    kind = message.kind.as_str(),
                    error = %e,
                    "Failed to serialize outbound message"
                );
            }
        }
    }
    (!frame.is_empty()).then_some(frame)
}

impl AsRef<ServerMessage> for ServerMessage {
    fn as_ref(&self) -> &ServerMessage {
        self
    }
}
