//! WebSocket session plumbing and the admin HTTP handlers.
//!
//! Each socket gets one task: it forwards room broadcasts out, answers
//! latency pings inline, and funnels every state-changing command into
//! the coordinator queue. A slow socket only lags its own broadcast
//! subscription; it can never hold the room up.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use syncjam_core::messages::{ClientMessage, ServerMessage};

use crate::app_state::SharedState;
use crate::coordinator::Command;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "unserializable server message");
            true
        }
    }
}

pub async fn handle_socket(socket: WebSocket, state: SharedState) {
    let session_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before attaching so nothing broadcast after our state
    // snapshot can be missed.
    let mut rx = state.tx.subscribe();

    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .commands
        .send(Command::Attach {
            session_id: session_id.clone(),
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    let Ok(room) = reply_rx.await else {
        return;
    };
    if !send_json(&mut sender, &ServerMessage::RoomState { room }).await {
        let _ = state
            .commands
            .send(Command::Detach {
                session_id: session_id.clone(),
            })
            .await;
        return;
    }

    loop {
        tokio::select! {
            // Room broadcasts from the coordinator.
            res = rx.recv() => match res {
                Ok(msg) => {
                    if !send_json(&mut sender, &msg).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%session_id, skipped, "slow consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            // Frames from this client.
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => {
                            if !dispatch(msg, &mut sender, &state, &session_id).await {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(%session_id, error = %e, "unparseable frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%session_id, error = %e, "socket error");
                    break;
                }
            },
        }
    }

    let _ = state.commands.send(Command::Detach { session_id }).await;
}

/// Route one client message. Pings are answered inline; everything that
/// can mutate room state goes through the coordinator queue so arrival
/// order is the one true order.
async fn dispatch(
    msg: ClientMessage,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    state: &SharedState,
    session_id: &str,
) -> bool {
    let cmd = match msg {
        ClientMessage::Join { name } => {
            state.registry.set_name(session_id, &name);
            tracing::info!(%session_id, name = %name, "client joined");
            return true;
        }
        ClientMessage::Ping { client_timestamp } => {
            let now = state.clock.now_ms();
            let rtt_ms = now as i64 - client_timestamp as i64;
            match state.registry.record_latency(session_id, rtt_ms, now) {
                Some(latency) => {
                    return send_json(
                        sender,
                        &ServerMessage::Pong {
                            client_timestamp,
                            server_timestamp: now,
                            latency,
                        },
                    )
                    .await;
                }
                // Measurement garbage; the registry already logged it.
                None => return true,
            }
        }
        ClientMessage::Play => Command::Play,
        ClientMessage::Pause => Command::Pause,
        ClientMessage::Skip => Command::Skip,
        ClientMessage::Previous => Command::Previous,
        ClientMessage::JumpTo { index } => Command::JumpTo { index },
        ClientMessage::Seek { seconds } => Command::Seek { seconds },
        ClientMessage::AddToQueue { track } => Command::AddToQueue { track },
        ClientMessage::RemoveFromQueue { index } => Command::RemoveFromQueue { index },
        ClientMessage::ReorderQueue {
            queue,
            current_track_index,
        } => Command::Reorder {
            queue,
            current_track_index,
        },
        ClientMessage::ReadyToPlay { epoch } => Command::ReadyToPlay {
            session_id: session_id.to_string(),
            epoch,
        },
    };
    state.commands.send(cmd).await.is_ok()
}

/// `GET /health`: room occupancy plus collaborator reachability.
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let room = {
        let (tx, rx) = oneshot::channel();
        match state.commands.send(Command::Health { reply: tx }).await {
            Ok(()) => rx.await.ok(),
            Err(_) => None,
        }
    };
    let resolver_up = state.resolver.health().await;
    let snapshot_up = state.snapshot.available().await;

    let room_json = room.map(|h| {
        json!({
            "name": state.room_name,
            "clients": h.clients,
            "mode": h.mode,
            "queueLen": h.queue_len,
        })
    });
    Json(json!({
        "status": if room_json.is_some() { "ok" } else { "degraded" },
        "room": room_json,
        "resolver": if resolver_up { "up" } else { "down" },
        "snapshot": if snapshot_up { "up" } else { "down" },
    }))
}

/// `POST /admin/reload`: tell every client to reload its player.
pub async fn admin_reload(State(state): State<SharedState>) -> impl IntoResponse {
    let receivers = state.tx.send(ServerMessage::ForceReload).unwrap_or(0);
    tracing::info!(receivers, "forceReload broadcast");
    Json(json!({ "reloaded": receivers }))
}
