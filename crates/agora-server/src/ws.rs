//! Websocket transport: JSON text frames in both directions.

use agora_shared::protocol::{ClientEvent, ServerEvent};
use agora_shared::types::ConnectMode;
use agora_shared::Reason;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::coordinator::Coordinator;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    session: Option<String>,
    mode: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let mode = params
        .mode
        .as_deref()
        .and_then(ConnectMode::parse)
        .unwrap_or_default();
    let coordinator = state.coordinator.clone();
    ws.on_upgrade(move |socket| run_socket(socket, coordinator, params.session, mode))
}

async fn run_socket(
    socket: WebSocket,
    coordinator: Coordinator,
    session: Option<String>,
    mode: ConnectMode,
) {
    let (mut sink, mut stream) = socket.split();

    let Some(connection) = coordinator.connect(session.as_deref(), mode).await else {
        if let Ok(frame) = ServerEvent::AuthRequired.to_json() {
            let _ = sink.send(Message::Text(frame)).await;
        }
        let _ = sink.close().await;
        return;
    };
    let handle = connection.handle;
    let mut events = connection.events;

    let mut writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let reader_coordinator = coordinator.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            // Only the wait for the next frame is interruptible; an event
            // already being handled always runs to completion.
            let message = tokio::select! {
                _ = &mut stop_rx => break,
                next = stream.next() => match next {
                    Some(Ok(message)) => message,
                    _ => break,
                },
            };
            match message {
                Message::Text(text) => match ClientEvent::from_json(&text) {
                    Ok(event) => reader_coordinator.handle_event(handle, event).await,
                    Err(e) => {
                        reader_coordinator
                            .reject(handle, Reason::ValidationFailed, format!("malformed event: {e}"))
                            .await
                    }
                },
                Message::Binary(_) => {
                    reader_coordinator
                        .reject(handle, Reason::ValidationFailed, "binary frames are not supported")
                        .await
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    let writer_finished = tokio::select! {
        _ = &mut writer => true,
        _ = &mut reader => false,
    };
    if writer_finished {
        let _ = stop_tx.send(());
        let _ = reader.await;
    } else {
        writer.abort();
    }

    coordinator.disconnect(handle).await;
    debug!(conn = %handle.id, user = %handle.user, "connection closed");
}
