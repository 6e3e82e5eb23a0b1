//! WebSocket push endpoint.
//!
//! Each socket is one connection of a session. Notifications for the session
//! are forwarded as JSON text frames. A text frame holding a correlation id is
//! answered with that workflow's current status, which is how a client
//! catches up after reconnecting.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use common::{CorrelationId, SessionId};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PushParams {
    pub session_id: String,
}

/// GET /ws?session_id=… — open a push connection for a session.
///
/// The session is checked before the upgrade, so a bad request gets the JSON
/// error body whether or not it asked to upgrade.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    params: Result<Query<PushParams>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, Response> {
    let session = session_from(params).map_err(IntoResponse::into_response)?;
    let ws = ws.map_err(IntoResponse::into_response)?;
    Ok(ws.on_upgrade(move |socket| serve(socket, state, session)))
}

fn session_from(params: Result<Query<PushParams>, QueryRejection>) -> Result<SessionId, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let session_id = params.session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::BadRequest("session_id is required".to_string()));
    }
    Ok(SessionId::new(session_id))
}

async fn serve(socket: WebSocket, state: Arc<AppState>, session: SessionId) {
    let (tx, mut notifications) = mpsc::channel(state.push_buffer);
    let connection = state.hub.register(session.clone(), tx).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            pushed = notifications.recv() => {
                let Some(notification) = pushed else { break };
                let Ok(text) = serde_json::to_string(&notification) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = status_reply(&state, text.as_str()).await;
                    if sink.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.hub.unregister(connection).await;
    tracing::debug!(%session, %connection, "push connection closed");
}

async fn status_reply(state: &AppState, text: &str) -> String {
    let reply = match CorrelationId::parse(text.trim()) {
        Err(e) => Err(format!("Invalid correlation id: {e}")),
        Ok(id) => state.status.status(id).await.map_err(|e| e.to_string()),
    };
    match reply.and_then(|report| serde_json::to_string(&report).map_err(|e| e.to_string())) {
        Ok(json) => json,
        Err(message) => serde_json::json!({ "error": message }).to_string(),
    }
}
