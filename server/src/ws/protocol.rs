use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::hub::connection::ConnectionHandle;
use crate::hub::dispatch::Delivery;
use crate::hub::message::ServerMessage;
use crate::hub::{Hub, ListId};

/// Raw inbound control message: `{"type": ..., "list_id": ..., "data": ...}`.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub list_id: Option<ListId>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(ListId),
    Unsubscribe(ListId),
    Ping,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{kind}` requires a positive list_id, got {list_id:?}")]
    InvalidListId {
        kind: &'static str,
        list_id: Option<ListId>,
    },
}

pub fn parse_command(text: &str) -> Result<ClientCommand, ProtocolError> {
    let message: ClientMessage = serde_json::from_str(text)?;
    match message.kind.as_str() {
        "subscribe" => list_id("subscribe", message.list_id).map(ClientCommand::Subscribe),
        "unsubscribe" => list_id("unsubscribe", message.list_id).map(ClientCommand::Unsubscribe),
        "ping" => Ok(ClientCommand::Ping),
        _ => Err(ProtocolError::UnknownType(message.kind)),
    }
}

fn list_id(kind: &'static str, list_id: Option<ListId>) -> Result<ListId, ProtocolError> {
    match list_id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(ProtocolError::InvalidListId { kind, list_id }),
    }
}

/// Handle one inbound text frame. Protocol errors are logged and the frame is
/// dropped; the connection stays open.
pub fn handle_text_message(text: &str, conn: &Arc<ConnectionHandle>, hub: &Hub) {
    match parse_command(text) {
        Ok(command) => {
            apply_command(command, conn, hub);
        }
        Err(e) => {
            tracing::warn!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                error = %e,
                "Ignoring client message"
            );
        }
    }
}

/// Apply a control command to the connection and queue its reply.
pub fn apply_command(command: ClientCommand, conn: &Arc<ConnectionHandle>, hub: &Hub) -> Delivery {
    let reply = match command {
        ClientCommand::Subscribe(list_id) => {
            conn.subscribe(list_id);
            tracing::info!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                list_id = list_id,
                "Client subscribed to list"
            );
            ServerMessage::subscribed(list_id)
        }
        ClientCommand::Unsubscribe(list_id) => {
            conn.unsubscribe(list_id);
            tracing::info!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                list_id = list_id,
                "Client unsubscribed from list"
            );
            ServerMessage::unsubscribed(list_id)
        }
        ClientCommand::Ping => ServerMessage::pong(Utc::now()),
    };

    let delivery = hub.deliver(conn, reply);
    if delivery == Delivery::Shed {
        tracing::warn!(
            user_id = conn.user_id(),
            connection_id = %conn.id(),
            "Reply queue full, connection dropped"
        );
    }
    delivery
}
