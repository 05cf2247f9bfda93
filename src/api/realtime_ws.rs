//! `/v1/realtime` WebSocket endpoint.
//!
//! The socket is split: a writer task drains the session's event channel
//! while the receive loop dispatches client messages into the session
//! manager. The receive loop is the single writer of session state.

use super::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub async fn realtime_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: HashMap<String, String>) {
    let (mut sink, mut stream) = socket.split();
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();

    // Initial config comes from the URL (`?model=…`, OpenAI SDK style).
    let mut initial_config = json!({});
    if let Some(model) = query.get("model") {
        initial_config["model"] = json!(model);
    }

    let session_id = state.sessions.create_session(event_tx, &initial_config);
    info!(session = %session_id, "realtime connection opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = event.to_string();
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(session = %session_id, error = %e, "websocket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                handle_client_message(&state, &session_id, text.as_str()).await;
            }
            Message::Binary(_) => {
                warn!(session = %session_id, "binary realtime messages are not supported");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    info!(session = %session_id, "realtime connection closed");
    state.sessions.close_session(&session_id);
    writer.abort();
}

async fn handle_client_message(state: &AppState, session_id: &str, raw: &str) {
    let request: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            send_error(state, session_id, &format!("invalid JSON: {e}")).await;
            return;
        }
    };

    match request.get("type").and_then(Value::as_str).unwrap_or("") {
        "session.update" => {
            let config = request.get("session").cloned().unwrap_or_else(|| json!({}));
            state.sessions.update_session(session_id, &config);
        }
        "input_audio_buffer.append" => {
            let audio = request.get("audio").and_then(Value::as_str).unwrap_or("");
            if !audio.is_empty() {
                state.sessions.append_audio(session_id, audio).await;
            }
        }
        "input_audio_buffer.commit" => {
            state.sessions.commit_audio(session_id).await;
        }
        "input_audio_buffer.clear" => {
            state.sessions.clear_audio(session_id);
        }
        other => {
            send_error(state, session_id, &format!("unknown message type: {other}")).await;
        }
    }
}

async fn send_error(state: &AppState, session_id: &str, message: &str) {
    // Errors travel through the same session event channel so ordering
    // with other events is preserved.
    state.sessions.update_session_error(session_id, message);
}
