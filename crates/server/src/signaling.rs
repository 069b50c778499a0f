//! C6 Connection Gateway: authenticates a bidirectional connection, routes
//! it to a Session Runtime, and wires in the workspace's file-change
//! watcher. Grounded on `signaling.rs`'s ping/pong keepalive loop and its
//! `browser_kick`-driven single-connection-per-session replacement,
//! generalized from a fixed video/input duplex to the §4.5/§4.6 JSON frame
//! alphabets, with bearer-token auth against the Persistence Port instead
//! of JWT.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use forge_protocol::{InboundCommand, MessageRole, OutwardEvent};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval};
use uuid::Uuid;

use crate::web::AppState;
use crate::workspace;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Handle one authenticated, authorized WebSocket connection for
/// `session_id`. Ownership and bearer-token validation have already
/// happened at the HTTP upgrade boundary (§4.6 "Authentication" /
/// "Authorization"); this function only deals with routing and framing.
pub async fn handle_session_ws(
    mut socket: WebSocket,
    session_id: Uuid,
    workspace_dir: String,
    user_id: Option<Uuid>,
    state: Arc<AppState>,
) {
    tracing::info!(%session_id, "Session stream connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutwardEvent>();
    let work_dir = PathBuf::from(&state.config.server.data_root)
        .join("workspaces")
        .join(&workspace_dir);
    let runtime = state
        .runtimes
        .open_or_rebind(session_id, work_dir.clone(), out_tx.clone(), user_id)
        .await;

    let kicked = runtime.rebind_kick.notified();
    tokio::pin!(kicked);

    let watch = state
        .watchers
        .subscribe(&work_dir, state.config.session.watcher_debounce_ms)
        .await;
    let (watch_id, mut watch_rx) = match watch {
        Ok(pair) => (Some(pair.0), Some(pair.1)),
        Err(e) => {
            tracing::warn!(%session_id, "failed to start file watcher: {e}");
            (None, None)
        }
    };

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut pending_assistant_text = String::new();

    loop {
        tokio::select! {
            _ = &mut kicked => {
                tracing::info!(%session_id, "Connection replaced by a newer stream");
                let msg = OutwardEvent::Error { message: "replaced".to_string() };
                if let Ok(json) = serde_json::to_string(&msg) {
                    let _ = socket.send(Message::Text(json.into())).await;
                }
                break;
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%session_id, "stream ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            Some(event) = out_rx.recv() => {
                if let OutwardEvent::MessageDelta { text } = &event {
                    pending_assistant_text.push_str(text);
                }
                if matches!(event, OutwardEvent::MessageEnd) && !pending_assistant_text.is_empty() {
                    persist_message(&state, session_id, MessageRole::Assistant, &pending_assistant_text).await;
                    pending_assistant_text.clear();
                }
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("failed to serialize outward event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Some(paths) = recv_opt(&mut watch_rx) => {
                let event = OutwardEvent::FilesChanged { paths };
                if let Ok(json) = serde_json::to_string(&event) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<InboundCommand>(&text) {
                            Ok(cmd) => {
                                if let InboundCommand::Prompt { message } | InboundCommand::Steer { message } = &cmd {
                                    persist_message(&state, session_id, MessageRole::User, message).await;
                                }
                                runtime.dispatch(cmd, &state.skills).await;
                            }
                            Err(e) => {
                                tracing::warn!(%session_id, "malformed frame: {e}");
                                runtime
                                    .send_event(OutwardEvent::Error { message: format!("malformed request: {e}") })
                                    .await;
                            }
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%session_id, "stream closed by client");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%session_id, "stream error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    runtime.unbind(&out_tx).await;
    if let Some(id) = watch_id {
        state.watchers.unsubscribe(&work_dir, id).await;
    }
    tracing::info!(%session_id, "Session stream disconnected");
}

async fn recv_opt(rx: &mut Option<mpsc::UnboundedReceiver<Vec<String>>>) -> Option<Vec<String>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn persist_message(state: &Arc<AppState>, session_id: Uuid, role: MessageRole, content: &str) {
    if let Err(e) = state
        .db
        .append_message(session_id, role, content, workspace::now_secs())
        .await
    {
        tracing::error!(%session_id, "failed to persist message: {e}");
    }
}
