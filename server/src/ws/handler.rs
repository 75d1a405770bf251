use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use jsonwebtoken::errors::ErrorKind;
use serde::Deserialize;

use crate::auth::{jwt, middleware::bearer_token};
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// Browsers cannot set headers on a WebSocket handshake, so the token usually
/// arrives as `?token=JWT`; an `Authorization: Bearer` header also works.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket close codes sent after upgrade:
/// 4001 = token expired
/// 4002 = token invalid
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint.
/// On auth failure, upgrades then immediately closes with the matching close code.
/// On success, runs the connection until the client goes away.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected WebSocket handshake");
            return rejection.into_response();
        }
    };

    let Some(token) = params
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .filter(|t| !t.is_empty())
    else {
        tracing::debug!("WebSocket request without a token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match jwt::validate_token(&state.jwt_secret, token) {
        Ok(claims) => claims,
        Err(err) => {
            let (close_code, reason) = match err.kind() {
                ErrorKind::ExpiredSignature => (CLOSE_TOKEN_EXPIRED, "Token expired"),
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };

            tracing::warn!(
                close_code = close_code,
                reason = reason,
                "WebSocket auth failed"
            );

            return ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            });
        }
    };

    if !state.hub.registry().has_capacity(claims.user_id) {
        tracing::warn!(
            user_id = claims.user_id,
            "Connection limit reached, refusing upgrade"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    tracing::info!(
        user_id = claims.user_id,
        username = %claims.username,
        "WebSocket connection authenticated"
    );

    let hub = state.hub.clone();
    let max_frame_bytes = hub.config().max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_failed_upgrade(|e| {
            tracing::warn!(error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| actor::run_connection(socket, hub, claims.user_id, claims.username))
}
