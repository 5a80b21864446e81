//! Live log/step streaming over WebSocket.
//!
//! Clients that need history first read the persisted logs, then attach
//! here and deduplicate on `seq`/`idx`: the stream carries only events
//! published after the subscription. The connection ends on client
//! disconnect, when the run reaches a terminal state, or when the
//! subscriber falls behind the bounded backlog.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;

use crate::api_errors::ApiError;
use crate::middleware::request_id;
use crate::state::AppState;

pub async fn logs_ws(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rid = request_id(&headers);
    if let Err(err) = state.store.get_run(run_id) {
        return ApiError::from(err).with_request_id(rid).into_response();
    }
    ws.on_upgrade(move |socket| stream_run_events(socket, state, run_id))
        .into_response()
}

async fn stream_run_events(mut socket: WebSocket, state: AppState, run_id: i64) {
    let mut events = state.bus.subscribe(run_id);
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(%error, run_id, "websocket receive error");
                        return;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(payload) => payload,
                            Err(error) => {
                                tracing::warn!(%error, run_id, "drop unencodable run event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            return;
                        }
                        if run_is_terminal(&state, run_id) {
                            let _ = socket.send(Message::Close(None)).await;
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(run_id, skipped, "subscriber lagged; disconnecting");
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                    Err(RecvError::Closed) => {
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}

fn run_is_terminal(state: &AppState, run_id: i64) -> bool {
    state
        .store
        .get_run(run_id)
        .map(|run| run.state.is_terminal())
        .unwrap_or(false)
}
