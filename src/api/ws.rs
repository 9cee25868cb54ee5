use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{future::OptionFuture, stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::apps::launch_build;
use super::error::ApiError;
use crate::engine::{BuildProgress, ProgressEvent};
use crate::AppState;

type WsSender = SplitSink<WebSocket, Message>;

/// Serialize and send; false once the client is gone.
async fn send_json<T: Serialize>(sender: &mut WsSender, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize websocket payload: {}", e);
            true
        }
    }
}

fn failure(app_id: &str, error: String) -> BuildProgress {
    BuildProgress {
        app_id: app_id.to_string(),
        event: ProgressEvent::Complete {
            success: false,
            error: Some(error),
            duration: None,
        },
    }
}

/// WebSocket endpoint streaming build progress
/// GET /api/v1/apps/:id/build/stream
pub async fn build_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.get(&app_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_build_stream(socket, state, app_id)))
}

async fn handle_build_stream(socket: WebSocket, state: Arc<AppState>, app_id: String) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before launching so the preamble is not missed
    let mut progress = state.manager.subscribe(&app_id);
    let builds = state.manager.builds();

    let mut build = match builds.current_app() {
        Some(current) if current == app_id => None,
        Some(_) => {
            let event = failure(&app_id, "A build is already in progress".to_string());
            let _ = send_json(&mut sender, &event).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        None => Some(launch_build(state.clone(), app_id.clone())),
    };

    loop {
        tokio::select! {
            event = progress.recv() => match event {
                Ok(event) => {
                    if !send_json(&mut sender, &event).await {
                        return;
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    let notice = BuildProgress {
                        app_id: app_id.clone(),
                        event: ProgressEvent::Message {
                            text: format!(
                                "[{} progress messages skipped; the build log has the full output]\n",
                                skipped
                            ),
                        },
                    };
                    if !send_json(&mut sender, &notice).await {
                        return;
                    }
                }
                Err(RecvError::Closed) => break,
            },

            Some(finished) = OptionFuture::from(build.as_mut()), if build.is_some() => {
                // Events published before the task finished are already queued
                loop {
                    match progress.try_recv() {
                        Ok(event) => {
                            if !send_json(&mut sender, &event).await {
                                return;
                            }
                            if event.is_terminal() {
                                let _ = sender.send(Message::Close(None)).await;
                                return;
                            }
                        }
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                // The build never reached the pipeline
                let error = match finished {
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(format!("Build task failed: {}", e)),
                };
                if let Some(error) = error {
                    let _ = send_json(&mut sender, &failure(&app_id, error)).await;
                }
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// WebSocket endpoint for streaming runtime container logs
/// GET /api/v1/apps/:id/logs/stream
pub async fn container_logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = state.manager.follow_container_logs(&app_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_container_logs(socket, lines)))
}

async fn handle_container_logs(socket: WebSocket, mut lines: crate::runtime::LogLineStream) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            line = lines.next() => {
                match line {
                    Some(line) => {
                        if !send_json(&mut sender, &line).await {
                            return;
                        }
                    }
                    None => {
                        // Container stopped or the stream closed
                        let _ = sender.send(Message::Close(None)).await;
                        return;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
