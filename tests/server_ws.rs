use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lockstep_lib::core::config::{RoomSeed, ServerConfig};
use lockstep_lib::core::events::{ClientMessage, PlaybackCommand, PlaybackEventType, ServerMessage};
use lockstep_lib::core::room::{PlaybackPhase, Track};
use lockstep_lib::core::{server, ServerCore};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, CancellationToken) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        auto_advance: false,
        rooms: vec![RoomSeed {
            room_id: "lobby".to_string(),
            administrator: "host".to_string(),
            tracks: vec![Track {
                id: "opener".to_string(),
                title: "Opener".to_string(),
                duration_ms: 240_000,
            }],
        }],
        ..ServerConfig::default()
    };
    let core = Arc::new(ServerCore::new(config).expect("seed rooms"));
    let listener = server::bind(&core.config().bind_addr).await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(listener, core, shutdown.clone().cancelled_owned()));
    (format!("ws://{addr}/ws"), shutdown)
}

async fn send(client: &mut Client, message: &ClientMessage) {
    let text = serde_json::to_string(message).expect("encode");
    client.send(Message::text(text)).await.expect("send");
}

async fn receive(client: &mut Client) -> ServerMessage {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("server replied in time")
            .expect("stream open")
            .expect("read frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("decode");
        }
    }
}

async fn join(url: &str, credential: &str) -> Client {
    let (mut client, _) = connect_async(url).await.expect("connect");
    send(
        &mut client,
        &ClientMessage::Authenticate {
            credential: credential.to_string(),
        },
    )
    .await;
    assert!(matches!(receive(&mut client).await, ServerMessage::Authenticated { .. }));
    send(
        &mut client,
        &ClientMessage::JoinRoom {
            room_id: "lobby".to_string(),
        },
    )
    .await;
    match receive(&mut client).await {
        ServerMessage::Joined { room_id, state } => {
            assert_eq!(room_id, "lobby");
            assert_eq!(state.phase, PlaybackPhase::Idle);
        }
        other => panic!("expected joined, got {other:?}"),
    }
    client
}

#[tokio::test]
async fn commands_are_answered_and_fanned_out_to_the_room() {
    let (url, shutdown) = start_server().await;
    let mut host = join(&url, "host-token").await;
    let mut guest = join(&url, "guest-token").await;

    send(
        &mut host,
        &ClientMessage::Command {
            request_id: 7,
            command: PlaybackCommand::Start {
                track_id: "opener".to_string(),
            },
        },
    )
    .await;

    let mut saw_event = false;
    let mut saw_result = false;
    while !(saw_event && saw_result) {
        match receive(&mut host).await {
            ServerMessage::Playback { event } => {
                assert_eq!(event.event_type, PlaybackEventType::PlaybackStarted);
                saw_event = true;
            }
            ServerMessage::CommandResult {
                request_id, state, ..
            } => {
                assert_eq!(request_id, 7);
                assert_eq!(state.map(|state| state.phase), Some(PlaybackPhase::Playing));
                saw_result = true;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    match receive(&mut guest).await {
        ServerMessage::Playback { event } => {
            assert_eq!(event.event_type, PlaybackEventType::PlaybackStarted);
            assert_eq!(event.room_id, "lobby");
            assert_eq!(
                event.data.current_track.map(|track| track.id),
                Some("opener".to_string())
            );
        }
        other => panic!("expected playback event, got {other:?}"),
    }

    send(
        &mut guest,
        &ClientMessage::Command {
            request_id: 8,
            command: PlaybackCommand::Pause,
        },
    )
    .await;
    match receive(&mut guest).await {
        ServerMessage::CommandResult {
            request_id, error, ..
        } => {
            assert_eq!(request_id, 8);
            assert_eq!(error.map(|failure| failure.kind), Some("unauthorized".to_string()));
        }
        other => panic!("expected command result, got {other:?}"),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn time_probes_echo_the_client_timestamp() {
    let (url, shutdown) = start_server().await;
    let mut client = join(&url, "guest-token").await;

    send(
        &mut client,
        &ClientMessage::TimeProbe {
            probe_id: 3,
            client_time: 42,
        },
    )
    .await;
    match receive(&mut client).await {
        ServerMessage::TimeProbe {
            probe_id,
            client_time,
            server_time,
        } => {
            assert_eq!(probe_id, 3);
            assert_eq!(client_time, 42);
            assert!(server_time > 0);
        }
        other => panic!("expected probe reply, got {other:?}"),
    }

    send(&mut client, &ClientMessage::GetRoomState).await;
    match receive(&mut client).await {
        ServerMessage::RoomState { state } => assert_eq!(state.room_id, "lobby"),
        other => panic!("expected room state, got {other:?}"),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn unauthenticated_connections_cannot_join() {
    let (url, shutdown) = start_server().await;
    let (mut client, _) = connect_async(url.as_str()).await.expect("connect");

    send(
        &mut client,
        &ClientMessage::Authenticate {
            credential: "wrong".to_string(),
        },
    )
    .await;
    assert!(matches!(receive(&mut client).await, ServerMessage::Error { .. }));

    send(
        &mut client,
        &ClientMessage::JoinRoom {
            room_id: "lobby".to_string(),
        },
    )
    .await;
    match receive(&mut client).await {
        ServerMessage::Error { message } => assert!(message.contains("authenticate")),
        other => panic!("expected error, got {other:?}"),
    }

    shutdown.cancel();
}
