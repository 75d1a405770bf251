//! REST endpoints around the real-time hub.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::middleware::Claims;
use crate::hub::event::Event;
use crate::hub::{ListId, UserId};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(default)]
    pub data: Value,
}

/// GET /api/ws/online-users returns users with at least one live connection.
pub async fn online_users(State(state): State<AppState>, _claims: Claims) -> Json<Value> {
    let online = state.hub.online_user_ids();
    Json(json!({
        "count": online.len(),
        "online_users": online,
    }))
}

/// POST /api/ws/broadcast/list/{id} pushes a list or item update to every
/// connection subscribed to the list. `data` is forwarded unchanged.
pub async fn broadcast_to_list(
    State(state): State<AppState>,
    claims: Claims,
    Path(list_id): Path<ListId>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let event = match req.kind.as_str() {
        "list_update" => Event::ListUpdated {
            list_id,
            update: req.data.into(),
        },
        "item_update" => Event::ItemUpdated {
            list_id,
            update: req.data.into(),
        },
        _ => {
            return Err((StatusCode::BAD_REQUEST, "Invalid message type".to_string()));
        }
    };

    tracing::debug!(
        user_id = claims.user_id,
        list_id = list_id,
        kind = event.kind().as_str(),
        "Broadcast requested over REST"
    );
    state.hub.publish(event);

    Ok(Json(json!({ "message": "Broadcast sent successfully" })))
}

/// POST /api/ws/notify/{user_id} pushes a notification to every connection of
/// one user.
pub async fn notify_user(
    State(state): State<AppState>,
    claims: Claims,
    Path(user_id): Path<UserId>,
    Json(req): Json<NotifyRequest>,
) -> Json<Value> {
    tracing::debug!(
        user_id = claims.user_id,
        target_user_id = user_id,
        "Notification requested over REST"
    );
    state.hub.publish(Event::Notification {
        user_id,
        notification: req.data.into(),
    });

    Json(json!({ "message": "Notification sent successfully" }))
}
