//! Typed events published into the hub by the CRUD side of the application.
//!
//! Each variant carries its own payload type. Payloads are opaque JSON: they
//! become the outbound `data` field exactly as the publisher supplied them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::message::{MessageKind, ServerMessage};
use super::{ListId, UserId};

/// A shopping list was created, renamed, or deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListUpdate {
    pub data: Value,
}

/// An item on a list changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemUpdate {
    pub data: Value,
}

/// A list was shared with, or unshared from, the target user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareUpdate {
    pub data: Value,
}

/// A notification row created for the target user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationPayload {
    pub data: Value,
}

impl From<Value> for ListUpdate {
    fn from(data: Value) -> Self {
        Self { data }
    }
}

impl From<Value> for ItemUpdate {
    fn from(data: Value) -> Self {
        Self { data }
    }
}

impl From<Value> for ShareUpdate {
    fn from(data: Value) -> Self {
        Self { data }
    }
}

impl From<Value> for NotificationPayload {
    fn from(data: Value) -> Self {
        Self { data }
    }
}

/// Who an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every connection of one user.
    User(UserId),
    /// Every connection, of any user, subscribed to the list.
    List(ListId),
    /// Every connection, minus those owned by `except`.
    All { except: UserId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ListUpdated {
        list_id: ListId,
        update: ListUpdate,
    },
    ItemUpdated {
        list_id: ListId,
        update: ItemUpdate,
    },
    ShareUpdated {
        user_id: UserId,
        list_id: Option<ListId>,
        update: ShareUpdate,
    },
    Notification {
        user_id: UserId,
        notification: NotificationPayload,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
}

impl Event {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ListUpdated { .. } => MessageKind::ListUpdate,
            Self::ItemUpdated { .. } => MessageKind::ItemUpdate,
            Self::ShareUpdated { .. } => MessageKind::ShareUpdate,
            Self::Notification { .. } => MessageKind::Notification,
            Self::UserOnline { .. } => MessageKind::UserOnline,
            Self::UserOffline { .. } => MessageKind::UserOffline,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::ListUpdated { list_id, .. } | Self::ItemUpdated { list_id, .. } => {
                Scope::List(*list_id)
            }
            Self::ShareUpdated { user_id, .. } | Self::Notification { user_id, .. } => {
                Scope::User(*user_id)
            }
            // A user is not told about their own presence change.
            Self::UserOnline { user_id } | Self::UserOffline { user_id } => {
                Scope::All { except: *user_id }
            }
        }
    }

    /// Build the outbound message, stamped with `now`.
    pub fn to_message(&self, now: DateTime<Utc>) -> ServerMessage {
        let kind = self.kind();
        let message = match self {
            Self::ListUpdated { list_id, update } => {
                ServerMessage::new(kind, update.data.clone()).with_list(*list_id)
            }
            Self::ItemUpdated { list_id, update } => {
                ServerMessage::new(kind, update.data.clone()).with_list(*list_id)
            }
            Self::ShareUpdated {
                user_id,
                list_id,
                update,
            } => {
                let mut message = ServerMessage::new(kind, update.data.clone()).with_user(*user_id);
                message.list_id = *list_id;
                message
            }
            Self::Notification {
                user_id,
                notification,
            } => ServerMessage::new(kind, notification.data.clone()).with_user(*user_id),
            Self::UserOnline { user_id } | Self::UserOffline { user_id } => {
                ServerMessage::new(kind, json!({ "user_id": user_id })).with_user(*user_id)
            }
        };
        message.issued_at(now)
    }
}
