use std::sync::{Arc, Mutex};
use std::time::Duration;

use lockstep_lib::core::config::{ListenerConfig, RoomSeed, ServerConfig, SyncTuning};
use lockstep_lib::core::events::PlaybackCommand;
use lockstep_lib::core::room::{PlaybackPhase, Track};
use lockstep_lib::core::sync::{
    AudioEngine, ConnectionState, EngineError, ListenerSession, SessionEvent, SessionEvents,
    SimulatedEngine,
};
use lockstep_lib::core::{server, ServerCore};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn record(&self, call: impl Into<String>) {
        self.0.lock().expect("call log").push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().expect("call log").clone()
    }
}

// Records every call that moves the play-head or changes the source.
struct RecordingEngine {
    inner: SimulatedEngine,
    log: CallLog,
}

impl RecordingEngine {
    fn boxed(log: &CallLog) -> Box<dyn AudioEngine> {
        Box::new(Self {
            inner: SimulatedEngine::new(),
            log: log.clone(),
        })
    }
}

impl AudioEngine for RecordingEngine {
    fn load(&mut self, track: &Track) -> Result<(), EngineError> {
        self.log.record(format!("load {}", track.id));
        self.inner.load(track)
    }

    fn loaded_track(&self) -> Option<&Track> {
        self.inner.loaded_track()
    }

    fn unload(&mut self) {
        self.log.record("unload");
        self.inner.unload();
    }

    fn position_ms(&self) -> Result<f64, EngineError> {
        self.inner.position_ms()
    }

    fn seek(&mut self, position_ms: f64) -> Result<(), EngineError> {
        self.log.record("seek");
        self.inner.seek(position_ms)
    }

    fn play(&mut self) -> Result<(), EngineError> {
        self.log.record("play");
        self.inner.play()
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.log.record("pause");
        self.inner.pause()
    }

    fn is_playing(&self) -> bool {
        self.inner.is_playing()
    }

    fn reload(&mut self) -> Result<(), EngineError> {
        self.log.record("reload");
        self.inner.reload()
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.log.record("reset");
        self.inner.reset()
    }

    fn volume(&self) -> f32 {
        self.inner.volume()
    }

    fn set_volume(&mut self, volume: f32) {
        self.log.record("set_volume");
        self.inner.set_volume(volume);
    }

    fn is_muted(&self) -> bool {
        self.inner.is_muted()
    }

    fn set_muted(&mut self, muted: bool) {
        self.log.record("set_muted");
        self.inner.set_muted(muted);
    }
}

fn seed(room_id: &str, track_id: &str) -> RoomSeed {
    RoomSeed {
        room_id: room_id.to_string(),
        administrator: "host".to_string(),
        tracks: vec![Track {
            id: track_id.to_string(),
            title: track_id.to_string(),
            duration_ms: 240_000,
        }],
    }
}

async fn start_server(heartbeat_timeout_secs: u64) -> (String, CancellationToken) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        auto_advance: false,
        heartbeat_timeout_secs,
        rooms: vec![seed("lobby", "opener"), seed("annex", "closer")],
        ..ServerConfig::default()
    };
    let core = Arc::new(ServerCore::new(config).expect("seed rooms"));
    let listener = server::bind(&core.config().bind_addr).await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(listener, core, shutdown.clone().cancelled_owned()));
    (format!("ws://{addr}/ws"), shutdown)
}

fn listener_config(url: &str, credential: &str, room_id: &str) -> ListenerConfig {
    ListenerConfig {
        server_url: url.to_string(),
        credential: credential.to_string(),
        room_id: Some(room_id.to_string()),
        sync: SyncTuning {
            reconnect_base_ms: 50,
            reconnect_max_ms: 200,
            connect_timeout_ms: 2_000,
            ..SyncTuning::default()
        },
    }
}

// Collects events up to and including the first one accepted by `wanted`.
async fn wait_for(
    events: &mut SessionEvents,
    mut wanted: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("session event arrived in time")
            .expect("session still running");
        let done = wanted(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn joined(room: &'static str) -> impl FnMut(&SessionEvent) -> bool {
    move |event: &SessionEvent| matches!(event, SessionEvent::Joined { room_id } if room_id == room)
}

fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn host_command(host: &ListenerSession, events: &mut SessionEvents, command: PlaybackCommand) {
    let request_id = host.send_playback(command).expect("send command");
    let seen = wait_for(events, |event| {
        matches!(event, SessionEvent::CommandResult { request_id: id, .. } if *id == request_id)
    })
    .await;
    match seen.last() {
        Some(SessionEvent::CommandResult { result, .. }) => {
            assert!(result.is_ok(), "host command rejected: {result:?}")
        }
        other => panic!("expected a command result, got {other:?}"),
    }
}

#[tokio::test]
async fn switching_rooms_drops_the_old_room() {
    let (url, shutdown) = start_server(30).await;
    let mut host = ListenerSession::new();
    let mut host_events = host
        .connect(listener_config(&url, "host-token", "lobby"), Box::new(SimulatedEngine::new()))
        .await;
    wait_for(&mut host_events, joined("lobby")).await;

    let log = CallLog::default();
    let mut guest = ListenerSession::new();
    let mut guest_events = guest
        .connect(listener_config(&url, "guest-token", "lobby"), RecordingEngine::boxed(&log))
        .await;
    wait_for(&mut guest_events, joined("lobby")).await;

    host_command(
        &host,
        &mut host_events,
        PlaybackCommand::Start {
            track_id: "opener".to_string(),
        },
    )
    .await;
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::RoomState(state)
            if state.room_id == "lobby" && state.phase == PlaybackPhase::Playing)
    })
    .await;

    guest.join_room("annex").expect("switch rooms");
    host_command(&host, &mut host_events, PlaybackCommand::Pause).await;

    let mut after_switch = wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::RoomState(state) if state.room_id == "annex")
    })
    .await;
    sleep(Duration::from_millis(300)).await;
    after_switch.extend(drain(&mut guest_events));

    assert!(after_switch
        .iter()
        .any(|event| matches!(event, SessionEvent::Joined { room_id } if room_id == "annex")));
    for event in &after_switch {
        if let SessionEvent::RoomState(state) = event {
            assert_eq!(state.room_id, "annex", "old room leaked after the switch");
            assert_eq!(state.phase, PlaybackPhase::Idle);
        }
    }

    let calls = log.calls();
    let last_source_call = calls
        .iter()
        .rev()
        .find(|call| call.starts_with("load") || *call == "unload");
    assert_eq!(last_source_call.map(String::as_str), Some("unload"));

    guest.disconnect().await;
    host.disconnect().await;
    shutdown.cancel();
}

#[tokio::test]
async fn disconnect_leaves_nothing_driving_the_engine() {
    let (url, shutdown) = start_server(30).await;
    let mut host = ListenerSession::new();
    let mut host_events = host
        .connect(listener_config(&url, "host-token", "lobby"), Box::new(SimulatedEngine::new()))
        .await;
    wait_for(&mut host_events, joined("lobby")).await;

    let log = CallLog::default();
    let mut guest = ListenerSession::new();
    let mut config = listener_config(&url, "guest-token", "lobby");
    config.sync.sync_interval_ms = 250;
    config.sync.play_state_interval_ms = 50;
    let mut guest_events = guest.connect(config, RecordingEngine::boxed(&log)).await;
    wait_for(&mut guest_events, joined("lobby")).await;

    host_command(
        &host,
        &mut host_events,
        PlaybackCommand::Start {
            track_id: "opener".to_string(),
        },
    )
    .await;
    wait_for(&mut guest_events, |event| {
        matches!(event, SessionEvent::PlayState(_))
    })
    .await;
    sleep(Duration::from_millis(600)).await;

    timeout(Duration::from_secs(5), guest.disconnect())
        .await
        .expect("disconnect returns promptly");
    assert!(!guest.is_running());

    let at_teardown = log.calls();
    assert!(at_teardown.iter().any(|call| call == "load opener"));
    assert_eq!(at_teardown.last().map(String::as_str), Some("unload"));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(log.calls(), at_teardown, "engine moved after teardown");

    let mut last = None;
    while let Some(event) = timeout(Duration::from_secs(5), guest_events.recv())
        .await
        .expect("event channel closes")
    {
        last = Some(event);
    }
    assert_eq!(
        last.map(|event| matches!(
            event,
            SessionEvent::Connection {
                state: ConnectionState::Disconnected,
                ..
            }
        )),
        Some(true)
    );

    host.disconnect().await;
    shutdown.cancel();
}

#[tokio::test]
async fn dropped_connections_are_reestablished() {
    let (url, shutdown) = start_server(1).await;
    let mut config = listener_config(&url, "guest-token", "lobby");
    config.sync.keepalive_secs = 60;

    let mut session = ListenerSession::new();
    let mut events = session.connect(config, Box::new(SimulatedEngine::new())).await;
    wait_for(&mut events, joined("lobby")).await;

    let dropped = wait_for(&mut events, |event| {
        matches!(
            event,
            SessionEvent::Connection {
                state: ConnectionState::Reconnecting,
                ..
            }
        )
    })
    .await;
    match dropped.last() {
        Some(SessionEvent::Connection { reason, .. }) => {
            assert!(reason.is_some(), "a dropped connection reports why")
        }
        other => panic!("expected a connection event, got {other:?}"),
    }

    let rejoined = wait_for(&mut events, joined("lobby")).await;
    assert!(rejoined.iter().any(|event| matches!(
        event,
        SessionEvent::Connection {
            state: ConnectionState::Connected,
            ..
        }
    )));
    assert!(rejoined
        .iter()
        .any(|event| matches!(event, SessionEvent::Authenticated { user_id } if user_id == "guest")));

    session.disconnect().await;
    shutdown.cancel();
}

async fn stalled_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("ws://{addr}/ws")
}

#[tokio::test]
async fn stalled_handshakes_time_out_and_retry() {
    let url = stalled_listener().await;
    let mut config = listener_config(&url, "guest-token", "lobby");
    config.sync.connect_timeout_ms = 200;

    let mut session = ListenerSession::new();
    let mut events = session.connect(config, Box::new(SimulatedEngine::new())).await;
    for _ in 0..2 {
        wait_for(&mut events, |event| {
            matches!(event, SessionEvent::Connection {
                state: ConnectionState::Reconnecting,
                reason: Some(reason),
            } if reason.contains("timed out"))
        })
        .await;
    }

    timeout(Duration::from_secs(5), session.disconnect())
        .await
        .expect("disconnect returns while the handshake stalls");
    assert!(!session.is_running());
}

#[tokio::test]
async fn disconnect_interrupts_a_pending_handshake() {
    let url = stalled_listener().await;
    let mut config = listener_config(&url, "guest-token", "lobby");
    config.sync.connect_timeout_ms = 60_000;

    let log = CallLog::default();
    let mut session = ListenerSession::new();
    let mut events = session.connect(config, RecordingEngine::boxed(&log)).await;
    wait_for(&mut events, |event| {
        matches!(
            event,
            SessionEvent::Connection {
                state: ConnectionState::Connecting,
                ..
            }
        )
    })
    .await;

    session.set_volume(0.5).expect("worker running");
    let request_id = session
        .send_playback(PlaybackCommand::Pause)
        .expect("worker running");
    let answered = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::CommandResult { request_id: id, .. } if *id == request_id)
    })
    .await;
    match answered.last() {
        Some(SessionEvent::CommandResult { result: Err(failure), .. }) => {
            assert_eq!(failure.kind, "not_connected")
        }
        other => panic!("expected an offline command result, got {other:?}"),
    }
    assert!(log.calls().iter().any(|call| call == "set_volume"));

    timeout(Duration::from_secs(5), session.disconnect())
        .await
        .expect("disconnect returns while the handshake stalls");
    assert!(!session.is_running());
}
