use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::events::{ClientMessage, CommandFailure, PlaybackCommand, ServerMessage, TimeResponse};
use super::hub::{ConnectionId, RegistryError};
use super::room::{CommandError, RoomSnapshot};
use super::ServerCore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server terminated: {0}")]
    Serve(std::io::Error),
}

pub fn router(core: Arc<ServerCore>) -> Router {
    Router::new()
        .route("/ws", get(handle_websocket))
        .route("/time", get(handle_time))
        .route("/rooms/{room_id}/state", get(handle_room_state))
        .with_state(core)
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

pub async fn serve<F>(
    listener: TcpListener,
    core: Arc<ServerCore>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("listening on http://{addr}");
    }
    axum::serve(listener, router(core))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

async fn handle_time(State(core): State<Arc<ServerCore>>) -> Json<TimeResponse> {
    Json(TimeResponse {
        server_time: core.now_ms(),
    })
}

async fn handle_room_state(
    State(core): State<Arc<ServerCore>>,
    Path(room_id): Path<String>,
) -> Response {
    match core.commands().room_state(&room_id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            let status = match err {
                CommandError::UnknownRoom(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(err.to_failure())).into_response()
        }
    }
}

async fn handle_websocket(ws: WebSocketUpgrade, State(core): State<Arc<ServerCore>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, core))
}

async fn handle_socket(socket: WebSocket, core: Arc<ServerCore>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(core.config().subscriber_queue_capacity.max(1));
    let id = core.registry().register(outbound_tx);
    log::debug!("connection {id} opened");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    log::warn!("failed to encode server message: {err}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let heartbeat = Duration::from_secs(core.config().heartbeat_timeout_secs.max(1));
    loop {
        let message = match timeout(heartbeat, receiver.next()).await {
            Err(_) => {
                log::info!("connection {id} silent for {heartbeat:?}; closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                log::debug!("connection {id} read failed: {err}");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handle_client_text(&core, id, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    core.registry().remove(id);
    writer.abort();
    log::debug!("connection {id} closed");
}

async fn handle_client_text(core: &ServerCore, id: ConnectionId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            reply_error(core, id, format!("invalid message: {err}"));
            return;
        }
    };

    match message {
        ClientMessage::Authenticate { credential } => {
            match core.authenticator().authenticate(&credential) {
                Ok(principal) => {
                    let user_id = principal.user_id.clone();
                    if core.registry().authenticate(id, principal).is_ok() {
                        log::info!("connection {id} authenticated as {user_id}");
                        core.registry()
                            .send_to(id, ServerMessage::Authenticated { user_id });
                    }
                }
                Err(err) => reply_error(core, id, err.to_string()),
            }
        }
        ClientMessage::JoinRoom { room_id } => join_room(core, id, room_id),
        ClientMessage::LeaveRoom => {
            if let Some(room_id) = core.registry().leave(id) {
                core.registry().send_to(id, ServerMessage::Left { room_id });
            }
        }
        ClientMessage::Command {
            request_id,
            command,
        } => {
            let result = execute_command(core, id, command).await;
            let (state, error) = match result {
                Ok(state) => (Some(state), None),
                Err(failure) => (None, Some(failure)),
            };
            core.registry().send_to(
                id,
                ServerMessage::CommandResult {
                    request_id,
                    state,
                    error,
                },
            );
        }
        ClientMessage::TimeProbe {
            probe_id,
            client_time,
        } => {
            core.registry().send_to(
                id,
                ServerMessage::TimeProbe {
                    probe_id,
                    client_time,
                    server_time: core.now_ms(),
                },
            );
        }
        ClientMessage::GetRoomState => {
            let Some(room_id) = core.registry().room_of(id) else {
                reply_error(core, id, "not in a room".to_string());
                return;
            };
            match core.commands().room_state(&room_id) {
                Ok(state) => {
                    core.registry().send_to(id, ServerMessage::RoomState { state });
                }
                Err(err) => reply_error(core, id, err.to_string()),
            }
        }
        ClientMessage::Ping => {
            core.registry().send_to(
                id,
                ServerMessage::Pong {
                    server_time: core.now_ms(),
                },
            );
        }
    }
}

fn join_room(core: &ServerCore, id: ConnectionId, room_id: String) {
    if !core.directory().room_exists(&room_id) {
        reply_error(core, id, format!("room {room_id} does not exist"));
        return;
    }
    match core.registry().join(id, &room_id) {
        Ok(previous) => {
            if let Some(previous) = previous.filter(|previous| previous != &room_id) {
                log::info!("connection {id} moved from room {previous} to {room_id}");
            } else {
                log::info!("connection {id} joined room {room_id}");
            }
            match core.commands().room_state(&room_id) {
                Ok(state) => {
                    core.registry()
                        .send_to(id, ServerMessage::Joined { room_id, state });
                }
                Err(err) => reply_error(core, id, err.to_string()),
            }
        }
        Err(RegistryError::NotAuthenticated(_)) => {
            reply_error(core, id, "authenticate before joining a room".to_string());
        }
        Err(err) => reply_error(core, id, err.to_string()),
    }
}

async fn execute_command(
    core: &ServerCore,
    id: ConnectionId,
    command: PlaybackCommand,
) -> Result<RoomSnapshot, CommandFailure> {
    let Some(principal) = core.registry().principal_of(id) else {
        return Err(CommandFailure {
            kind: "unauthenticated".to_string(),
            message: "authenticate before sending commands".to_string(),
        });
    };
    let Some(room_id) = core.registry().room_of(id) else {
        return Err(CommandFailure {
            kind: "not_in_room".to_string(),
            message: "join a room before sending commands".to_string(),
        });
    };
    core.commands()
        .execute(&principal, &room_id, command)
        .await
        .map_err(|err| err.to_failure())
}

fn reply_error(core: &ServerCore, id: ConnectionId, message: String) {
    core.registry().send_to(id, ServerMessage::Error { message });
}
