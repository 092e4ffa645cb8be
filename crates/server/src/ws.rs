//! # Push Channel WebSocket
//!
//! One endpoint serves both peers. Browser sessions connect with
//! `?session_id=...` and receive routed client events; the stage worker
//! process connects with `?token=<shared secret>` and feeds worker
//! events into the hub. Answers and cancellations from browsers go
//! through the hub and are also forwarded to a connected worker peer.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use propgen_core::channel::{BrowserCommand, ClientEvent, WorkerEvent};

use crate::SharedState;

#[derive(Deserialize)]
pub struct WsParams {
    session_id: Option<String>,
    token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    if let Some(token) = params.token {
        if token == state.worker_secret {
            return ws
                .on_upgrade(move |socket| handle_worker_socket(socket, state))
                .into_response();
        }
        return (StatusCode::UNAUTHORIZED, "invalid worker token").into_response();
    }

    match params.session_id {
        Some(session_id) if !session_id.is_empty() => ws
            .on_upgrade(move |socket| handle_browser_socket(socket, state, session_id))
            .into_response(),
        _ => (StatusCode::BAD_REQUEST, "session_id required").into_response(),
    }
}

/// The authenticated worker peer. Inbound messages are worker events
/// destined for browser sessions; outbound messages are the browser
/// commands (answers, cancels) the worker should observe.
async fn handle_worker_socket(socket: WebSocket, state: SharedState) {
    info!("worker peer connected");
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<BrowserCommand>(64);
    *state.worker_tx.write().await = Some(tx.clone());

    let send_task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&cmd) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let events_tx = state.hub.events_sender();
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<WorkerEvent>(&text) {
                Ok(event) => {
                    let _ = events_tx.send(event).await;
                }
                Err(e) => warn!("unparseable worker event: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // A replacement peer may have installed its own sender while this
    // connection was draining; only clear our own.
    state.clear_worker_tx(&tx).await;
    send_task.abort();
    info!("worker peer disconnected");
}

async fn handle_browser_socket(socket: WebSocket, state: SharedState, session_id: String) {
    info!(session_id = %session_id, "browser session connected");
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ClientEvent>(64);
    let registry = state.hub.registry();
    registry.register_session(&session_id, tx).await;

    // Catch the (re)connecting page up on its bound jobs, including a
    // still-pending question.
    state.hub.replay_for_session(&session_id).await;

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<BrowserCommand>(&text) {
                Ok(cmd) => handle_command(&state, cmd).await,
                Err(e) => debug!(session_id = %session_id, "ignoring message: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    registry.unregister_session(&session_id).await;
    send_task.abort();
    info!(session_id = %session_id, "browser session disconnected");
}

async fn handle_command(state: &SharedState, cmd: BrowserCommand) {
    match &cmd {
        BrowserCommand::Answer {
            job_id,
            question_id,
            answer,
        } => {
            if let Err(e) = state.hub.submit_answer(job_id, question_id, answer) {
                warn!(job_id = %job_id, "answer handling failed: {}", e);
            }
        }
        BrowserCommand::Cancel { job_id } => {
            if let Err(e) = state.hub.cancel(job_id).await {
                warn!(job_id = %job_id, "cancel handling failed: {}", e);
            }
        }
    }
    state.forward_to_worker(cmd).await;
}
