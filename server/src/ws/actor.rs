use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::config::HubConfig;
use crate::hub::connection::{ConnectionHandle, OutboundReceiver};
use crate::hub::message::encode_batch;
use crate::hub::{Hub, UserId};
use crate::ws::protocol;

/// Why the reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExit {
    ClientClosed,
    StreamEnded,
    ReceiveError,
    IdleTimeout,
}

/// Why the writer task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteExit {
    QueueClosed,
    SendFailed,
    SendTimedOut,
}

/// Run one authenticated WebSocket connection until it disconnects.
///
/// Splits the socket into reader and writer halves:
/// - Writer task: owns the sink, drains the outbound queue and sends keepalive pings
/// - Reader loop: processes incoming frames, dispatches control messages
///
/// Whichever side stops first ends the connection. The connection is always
/// unregistered from the hub before this returns.
pub async fn run_connection(socket: WebSocket, hub: Arc<Hub>, user_id: UserId, username: String) {
    let (conn, rx) = match hub.connect(user_id) {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!(user_id = user_id, error = %e, "Rejecting WebSocket connection");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: "Connection limit reached".into(),
                })))
                .await;
            return;
        }
    };

    tracing::info!(
        user_id = user_id,
        username = %username,
        connection_id = %conn.id(),
        "WebSocket connection opened"
    );

    let config = hub.config().clone();
    let (ws_sender, ws_receiver) = socket.split();
    let mut writer = tokio::spawn(writer_task(ws_sender, rx, config.clone(), conn.clone()));

    let mut writer_done = false;
    tokio::select! {
        exit = read_loop(ws_receiver, &hub, &conn, config.idle_timeout()) => {
            tracing::debug!(connection_id = %conn.id(), reason = ?exit, "Reader stopped");
        }
        exit = &mut writer => {
            writer_done = true;
            tracing::debug!(connection_id = %conn.id(), reason = ?exit.ok(), "Writer stopped");
        }
    }

    // Closes the queue; the writer flushes what is left and sends a close frame.
    hub.disconnect(&conn);

    if !writer_done && timeout(config.write_timeout(), &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::info!(
        user_id = user_id,
        username = %username,
        connection_id = %conn.id(),
        "WebSocket connection closed"
    );
}

async fn read_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    hub: &Hub,
    conn: &Arc<ConnectionHandle>,
    idle_timeout: Duration,
) -> ReadExit {
    loop {
        // Any inbound frame, pongs included, counts as liveness.
        let next = match timeout(idle_timeout, ws_receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(
                    user_id = conn.user_id(),
                    connection_id = %conn.id(),
                    "No traffic from client within idle timeout, closing"
                );
                return ReadExit::IdleTimeout;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), conn, hub);
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        bytes = data.len(),
                        "Ignoring binary frame (protocol is JSON text)"
                    );
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        reason = ?frame,
                        "Client initiated close"
                    );
                    return ReadExit::ClientClosed;
                }
            },
            Some(Err(e)) => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    error = %e,
                    "WebSocket receive error"
                );
                return ReadExit::ReceiveError;
            }
            None => return ReadExit::StreamEnded,
        }
    }
}

/// Writer task: drains the outbound queue to the socket and sends keepalive
/// pings on a fixed interval.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    config: HubConfig,
    conn: Arc<ConnectionHandle>,
) -> WriteExit {
    let ping_interval = config.ping_interval();
    let write_timeout = config.write_timeout();
    let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch = Vec::with_capacity(config.max_batch);

    loop {
        let frame = tokio::select! {
            next = rx.recv() => {
                let Some(first) = next else {
                    // Queue closed by the hub and fully drained.
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    }));
                    let _ = timeout(write_timeout, ws_sender.send(close)).await;
                    return WriteExit::QueueClosed;
                };

                // Coalesce whatever is already queued, preserving order.
                batch.clear();
                batch.push(first);
                while batch.len() < config.max_batch {
                    match rx.try_recv() {
                        Ok(next) => batch.push(next),
                        Err(_) => break,
                    }
                }

                let sent_at = Utc::now();
                tracing::trace!(
                    connection_id = %conn.id(),
                    messages = batch.len(),
                    queued_ms = (sent_at - batch[0].issued_at).num_milliseconds(),
                    "Writing batch"
                );
                match encode_batch(&batch, sent_at) {
                    Some(text) => Message::Text(text.into()),
                    None => continue,
                }
            }
            _ = keepalive.tick() => Message::Ping(Default::default()),
        };

        match timeout(write_timeout, ws_sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket send failed");
                return WriteExit::SendFailed;
            }
            Err(_) => {
                tracing::warn!(
                    user_id = conn.user_id(),
                    connection_id = %conn.id(),
                    "WebSocket write timed out"
                );
                return WriteExit::SendTimedOut;
            }
        }
    }
}
