use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::drift::{DriftCorrector, PlayStateChange, RecoveryTier, SyncTick, TickReport};
use super::engine::AudioEngine;
use super::estimator::{ClockOffsetEstimate, ClockSyncEstimator, ProbeProgress, RoundOutcome};
use crate::core::clock::epoch_millis;
use crate::core::config::{ListenerConfig, SyncTuning};
use crate::core::events::{ClientMessage, CommandFailure, PlaybackCommand, ServerMessage};
use crate::core::room::RoomSnapshot;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("listener session is not running")]
    NotRunning,
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        source: Box<tungstenite::Error>,
    },
    #[error("timed out connecting to {url} after {timeout_ms}ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },
    #[error("websocket error: {0}")]
    Transport(#[from] Box<tungstenite::Error>),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server closed the connection")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection {
        state: ConnectionState,
        reason: Option<String>,
    },
    Authenticated {
        user_id: String,
    },
    Joined {
        room_id: String,
    },
    Left {
        room_id: String,
    },
    RoomState(RoomSnapshot),
    CommandResult {
        request_id: u64,
        result: Result<RoomSnapshot, CommandFailure>,
    },
    ClockEstimate(ClockOffsetEstimate),
    Correction(TickReport),
    PlayState(PlayStateChange),
    SyncFailed {
        message: String,
    },
    ServerError {
        message: String,
    },
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

pub struct ListenerSession {
    worker: Option<JoinHandle<()>>,
    command_tx: Option<mpsc::UnboundedSender<SessionCommand>>,
    next_request_id: AtomicU64,
}

impl ListenerSession {
    pub fn new() -> Self {
        Self {
            worker: None,
            command_tx: None,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub async fn connect(
        &mut self,
        config: ListenerConfig,
        engine: Box<dyn AudioEngine>,
    ) -> SessionEvents {
        self.disconnect().await;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_listener_worker(config, engine, command_rx, event_tx));

        self.command_tx = Some(command_tx);
        self.worker = Some(handle);
        event_rx
    }

    /// Stops the worker and waits for it; no timer touches the engine afterwards.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(SessionCommand::Disconnect);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    pub fn join_room(&self, room_id: impl Into<String>) -> Result<(), SessionError> {
        self.send_command(SessionCommand::JoinRoom(room_id.into()))
    }

    pub fn leave_room(&self) -> Result<(), SessionError> {
        self.send_command(SessionCommand::LeaveRoom)
    }

    pub fn send_playback(&self, command: PlaybackCommand) -> Result<u64, SessionError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.send_command(SessionCommand::Playback {
            request_id,
            command,
        })?;
        Ok(request_id)
    }

    pub fn refresh_state(&self) -> Result<(), SessionError> {
        self.send_command(SessionCommand::RefreshState)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.send_command(SessionCommand::SetVolume(volume))
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.send_command(SessionCommand::SetMuted(muted))
    }

    fn send_command(&self, command: SessionCommand) -> Result<(), SessionError> {
        let Some(tx) = &self.command_tx else {
            return Err(SessionError::NotRunning);
        };
        tx.send(command).map_err(|_| SessionError::NotRunning)
    }
}

impl Default for ListenerSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum SessionCommand {
    Disconnect,
    JoinRoom(String),
    LeaveRoom,
    Playback {
        request_id: u64,
        command: PlaybackCommand,
    },
    RefreshState,
    SetVolume(f32),
    SetMuted(bool),
}

struct LiveConnection {
    sink: WsSink,
    stream: WsSource,
}

// Everything that survives a reconnect.
struct SyncState {
    tuning: SyncTuning,
    estimator: ClockSyncEstimator,
    corrector: DriftCorrector,
    engine: Box<dyn AudioEngine>,
    events: mpsc::UnboundedSender<SessionEvent>,
    desired_room: Option<String>,
    snapshot: Option<RoomSnapshot>,
    next_sync: Option<Instant>,
    next_probe: Option<Instant>,
    probe_deadline: Option<Instant>,
}

impl SyncState {
    fn new(
        tuning: SyncTuning,
        engine: Box<dyn AudioEngine>,
        events: mpsc::UnboundedSender<SessionEvent>,
        desired_room: Option<String>,
    ) -> Self {
        Self {
            estimator: ClockSyncEstimator::new(tuning.clone()),
            corrector: DriftCorrector::new(tuning.clone()),
            tuning,
            engine,
            events,
            desired_room,
            snapshot: None,
            next_sync: None,
            next_probe: None,
            probe_deadline: None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn is_current_room(&self, room_id: &str) -> bool {
        self.desired_room.as_deref() == Some(room_id)
    }

    fn server_now_ms(&self) -> f64 {
        self.estimator.server_time_ms(epoch_millis())
    }

    fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        if !self.is_current_room(&snapshot.room_id) {
            return;
        }
        if track_changed(self.snapshot.as_ref(), &snapshot) {
            self.corrector.reset();
            self.next_sync = None;
        }
        self.snapshot = Some(snapshot.clone());
        self.sync_play_state();
        if self.next_sync.is_none() {
            self.next_sync = Some(Instant::now() + self.corrector.interval());
        }
        self.emit(SessionEvent::RoomState(snapshot));
    }

    fn sync_play_state(&mut self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let server_now = self.estimator.server_time_ms(epoch_millis());
        match self
            .corrector
            .sync_play_state(snapshot, server_now, self.engine.as_mut())
        {
            Ok(PlayStateChange::Unchanged) => {}
            Ok(change) => {
                log::info!("play state: {change:?}");
                self.emit(SessionEvent::PlayState(change));
            }
            Err(err) => log::warn!("failed to sync play state: {err}"),
        }
    }

    // Returns whether a clock probe round is wanted.
    fn run_correction(&mut self) -> bool {
        self.next_sync = Some(Instant::now() + self.corrector.interval());
        let Some(snapshot) = &self.snapshot else {
            return false;
        };
        let server_now = self.server_now_ms();
        let tolerance = self.estimator.tolerance_ms(&self.corrector.recent_gaps());
        let tick = self
            .corrector
            .tick(snapshot, server_now, tolerance, self.engine.as_mut());
        self.next_sync = Some(Instant::now() + self.corrector.interval());

        let SyncTick::Ran(report) = tick else {
            return false;
        };
        let escalation = report.escalation;
        self.emit(SessionEvent::Correction(report));
        match escalation {
            Some(RecoveryTier::RecomputeClock) => true,
            Some(RecoveryTier::GiveUp) => {
                let message = format!(
                    "playback could not be kept in sync after {} failed corrections",
                    self.corrector.failure_count()
                );
                log::warn!("{message}");
                self.emit(SessionEvent::SyncFailed { message });
                false
            }
            _ => false,
        }
    }

    fn clear_room(&mut self) {
        self.snapshot = None;
        self.next_sync = None;
        self.next_probe = None;
        self.probe_deadline = None;
        self.estimator.cancel_round();
        self.corrector.reset();
        let _ = self.engine.pause();
        self.engine.unload();
    }

    fn handle_offline_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Disconnect => {}
            SessionCommand::JoinRoom(room_id) => {
                self.clear_room();
                self.desired_room = Some(room_id);
            }
            SessionCommand::LeaveRoom => {
                self.clear_room();
                self.desired_room = None;
            }
            SessionCommand::Playback { request_id, .. } => {
                self.emit(SessionEvent::CommandResult {
                    request_id,
                    result: Err(CommandFailure {
                        kind: "not_connected".to_string(),
                        message: "not connected to the server".to_string(),
                    }),
                });
            }
            SessionCommand::RefreshState => {}
            SessionCommand::SetVolume(volume) => self.engine.set_volume(volume),
            SessionCommand::SetMuted(muted) => self.engine.set_muted(muted),
        }
    }
}

async fn run_listener_worker(
    config: ListenerConfig,
    engine: Box<dyn AudioEngine>,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let tuning = config.sync.clone();
    let mut sync = SyncState::new(tuning.clone(), engine, events, config.room_id.clone());
    let mut reconnect_attempt: u32 = 0;
    let mut latest_reason: Option<String> = None;
    let mut should_exit = false;
    let mut has_connected_once = false;

    while !should_exit {
        let connecting_state = next_connecting_state(reconnect_attempt, has_connected_once);
        set_connection_state(&sync, connecting_state, latest_reason.clone());

        let attempt = connect_or_disconnect(&config.server_url, &tuning, &mut command_rx, &mut sync).await;
        let mut connection = match attempt {
            None => break,
            Some(Ok(connection)) => connection,
            Some(Err(err)) => {
                reconnect_attempt = reconnect_attempt.saturating_add(1);
                latest_reason = Some(err.to_string());
                let delay = reconnect_delay(reconnect_attempt, &tuning, &mut rand::thread_rng());
                log::warn!("connection failed: {err}; retrying in {delay:?}");
                if wait_for_retry_or_disconnect(&mut command_rx, &mut sync, delay).await {
                    should_exit = true;
                }
                continue;
            }
        };

        let connected_at = Instant::now();
        latest_reason = None;
        has_connected_once = true;
        set_connection_state(&sync, ConnectionState::Connected, None);
        log::info!("connected to {}", config.server_url);

        if let Err(err) = send_message(
            &mut connection.sink,
            &ClientMessage::Authenticate {
                credential: config.credential.clone(),
            },
        )
        .await
        {
            latest_reason = Some(err.to_string());
        }

        let mut play_state_tick = interval(Duration::from_millis(tuning.play_state_interval_ms.max(1)));
        play_state_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keepalive_tick = interval(Duration::from_secs(tuning.keepalive_secs.max(1)));
        keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while latest_reason.is_none() {
            tokio::select! {
                maybe_cmd = command_rx.recv() => {
                    match maybe_cmd {
                        None | Some(SessionCommand::Disconnect) => {
                            should_exit = true;
                            break;
                        }
                        Some(command) => {
                            if let Err(err) = handle_live_command(command, &mut connection.sink, &mut sync).await {
                                latest_reason = Some(err.to_string());
                            }
                        }
                    }
                }
                message = connection.stream.next() => {
                    let Some(message) = message else {
                        latest_reason = Some(SessionError::Closed.to_string());
                        break;
                    };
                    let message = match message {
                        Ok(message) => message,
                        Err(err) => {
                            latest_reason = Some(format!("websocket read failed: {err}"));
                            break;
                        }
                    };
                    match message {
                        Message::Text(text) => {
                            if let Err(err) = handle_server_text(text.as_str(), &mut connection.sink, &mut sync).await {
                                latest_reason = Some(err.to_string());
                            }
                        }
                        Message::Close(_) => {
                            latest_reason = Some(SessionError::Closed.to_string());
                        }
                        _ => {}
                    }
                }
                _ = wait_until(sync.next_sync) => {
                    if sync.run_correction() {
                        if let Err(err) = start_probe_round(&mut connection.sink, &mut sync).await {
                            latest_reason = Some(err.to_string());
                        }
                    }
                }
                _ = play_state_tick.tick() => {
                    sync.sync_play_state();
                }
                _ = wait_until(sync.next_probe) => {
                    if let Err(err) = start_probe_round(&mut connection.sink, &mut sync).await {
                        latest_reason = Some(err.to_string());
                    }
                }
                _ = wait_until(sync.probe_deadline) => {
                    sync.probe_deadline = None;
                    if let Some(outcome) = sync.estimator.poll_deadline(epoch_millis()) {
                        finish_probe_round(&mut sync, outcome);
                    }
                }
                _ = keepalive_tick.tick() => {
                    if let Err(err) = send_message(&mut connection.sink, &ClientMessage::Ping).await {
                        latest_reason = Some(err.to_string());
                    }
                }
            }
        }

        sync.estimator.cancel_round();
        sync.probe_deadline = None;
        sync.next_probe = None;
        sync.next_sync = None;

        if should_exit {
            let _ = connection.sink.close().await;
            break;
        }

        reconnect_attempt = next_reconnect_attempt(reconnect_attempt, connected_at.elapsed(), &tuning);
        let delay = reconnect_delay(reconnect_attempt, &tuning, &mut rand::thread_rng());
        log::warn!(
            "connection lost ({}); reconnecting in {delay:?}",
            latest_reason.as_deref().unwrap_or("unknown reason")
        );
        set_connection_state(&sync, ConnectionState::Reconnecting, latest_reason.clone());
        if wait_for_retry_or_disconnect(&mut command_rx, &mut sync, delay).await {
            should_exit = true;
        }
    }

    sync.clear_room();
    set_connection_state(&sync, ConnectionState::Disconnected, latest_reason);
}

async fn connect_or_disconnect(
    url: &str,
    tuning: &SyncTuning,
    command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    sync: &mut SyncState,
) -> Option<Result<LiveConnection, SessionError>> {
    let connect = timeout(Duration::from_millis(tuning.connect_timeout_ms.max(1)), connect_session(url));
    tokio::pin!(connect);
    loop {
        tokio::select! {
            result = &mut connect => {
                return Some(match result {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::ConnectTimeout {
                        url: url.to_string(),
                        timeout_ms: tuning.connect_timeout_ms,
                    }),
                });
            }
            maybe_cmd = command_rx.recv() => match maybe_cmd {
                None | Some(SessionCommand::Disconnect) => return None,
                Some(command) => sync.handle_offline_command(command),
            },
        }
    }
}

async fn connect_session(url: &str) -> Result<LiveConnection, SessionError> {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|source| SessionError::Connect {
            url: url.to_string(),
            source: Box::new(source),
        })?;
    let (sink, stream) = socket.split();
    Ok(LiveConnection { sink, stream })
}

async fn handle_live_command(
    command: SessionCommand,
    sink: &mut WsSink,
    sync: &mut SyncState,
) -> Result<(), SessionError> {
    match command {
        SessionCommand::JoinRoom(room_id) => {
            if sync.is_current_room(&room_id) && sync.snapshot.is_some() {
                return Ok(());
            }
            sync.clear_room();
            sync.desired_room = Some(room_id.clone());
            send_message(sink, &ClientMessage::JoinRoom { room_id }).await
        }
        SessionCommand::LeaveRoom => {
            sync.clear_room();
            if sync.desired_room.take().is_none() {
                return Ok(());
            }
            send_message(sink, &ClientMessage::LeaveRoom).await
        }
        SessionCommand::Playback {
            request_id,
            command,
        } => {
            send_message(
                sink,
                &ClientMessage::Command {
                    request_id,
                    command,
                },
            )
            .await
        }
        SessionCommand::RefreshState => send_message(sink, &ClientMessage::GetRoomState).await,
        other => {
            sync.handle_offline_command(other);
            Ok(())
        }
    }
}

async fn handle_server_text(
    text: &str,
    sink: &mut WsSink,
    sync: &mut SyncState,
) -> Result<(), SessionError> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            log::debug!("ignoring unparseable server message: {err}");
            return Ok(());
        }
    };
    if let Some(server_time) = message.server_time() {
        sync.estimator.bootstrap(server_time, epoch_millis());
    }

    match message {
        ServerMessage::Authenticated { user_id } => {
            log::info!("authenticated as {user_id}");
            sync.emit(SessionEvent::Authenticated { user_id });
            if let Some(room_id) = sync.desired_room.clone() {
                send_message(sink, &ClientMessage::JoinRoom { room_id }).await?;
            }
        }
        ServerMessage::Joined { room_id, state } => {
            if !sync.is_current_room(&room_id) {
                return Ok(());
            }
            log::info!("joined room {room_id}");
            sync.emit(SessionEvent::Joined {
                room_id: room_id.clone(),
            });
            sync.apply_snapshot(state);
            start_probe_round(sink, sync).await?;
        }
        ServerMessage::Left { room_id } => {
            sync.emit(SessionEvent::Left { room_id });
        }
        ServerMessage::Playback { event } => {
            log::debug!(
                "{} in room {}",
                event.event_type.as_str(),
                event.room_id
            );
            sync.apply_snapshot(event.data);
        }
        ServerMessage::RoomState { state } => sync.apply_snapshot(state),
        ServerMessage::CommandResult {
            request_id,
            state,
            error,
        } => {
            let result = match (state, error) {
                (_, Some(failure)) => Err(failure),
                (Some(state), None) => Ok(state),
                (None, None) => Err(CommandFailure {
                    kind: "empty_result".to_string(),
                    message: "server returned neither state nor error".to_string(),
                }),
            };
            sync.emit(SessionEvent::CommandResult { request_id, result });
        }
        ServerMessage::TimeProbe {
            probe_id,
            server_time,
            ..
        } => match sync.estimator.on_probe_reply(probe_id, server_time, epoch_millis()) {
            ProbeProgress::Ignored => {}
            ProbeProgress::Continue => send_next_probe(sink, sync).await?,
            ProbeProgress::Completed(estimate) => {
                finish_probe_round(sync, RoundOutcome::Completed(estimate))
            }
        },
        ServerMessage::Pong { .. } => {}
        ServerMessage::Error { message } => {
            log::warn!("server error: {message}");
            sync.emit(SessionEvent::ServerError { message });
        }
    }
    Ok(())
}

async fn start_probe_round(sink: &mut WsSink, sync: &mut SyncState) -> Result<(), SessionError> {
    if sync.desired_room.is_none() {
        return Ok(());
    }
    if !sync.estimator.begin_round(epoch_millis()) {
        log::debug!("clock probe round already in flight; deferring");
        return Ok(());
    }
    sync.next_probe = None;
    sync.probe_deadline = Some(Instant::now() + Duration::from_millis(sync.tuning.probe_timeout_ms));
    send_next_probe(sink, sync).await
}

async fn send_next_probe(sink: &mut WsSink, sync: &mut SyncState) -> Result<(), SessionError> {
    let Some(request) = sync.estimator.next_probe(epoch_millis()) else {
        return Ok(());
    };
    send_message(
        sink,
        &ClientMessage::TimeProbe {
            probe_id: request.probe_id,
            client_time: request.client_time,
        },
    )
    .await
}

fn finish_probe_round(sync: &mut SyncState, outcome: RoundOutcome) {
    sync.probe_deadline = None;
    sync.next_probe = Some(Instant::now() + sync.estimator.next_round_delay());
    match outcome {
        RoundOutcome::Completed(estimate) | RoundOutcome::FellBack(estimate) => {
            sync.emit(SessionEvent::ClockEstimate(estimate));
        }
        RoundOutcome::Failed { .. } => {}
    }
}

async fn send_message(sink: &mut WsSink, message: &ClientMessage) -> Result<(), SessionError> {
    let text = serde_json::to_string(message)?;
    sink.send(Message::text(text))
        .await
        .map_err(|err| SessionError::Transport(Box::new(err)))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn next_connecting_state(reconnect_attempt: u32, has_connected_once: bool) -> ConnectionState {
    if reconnect_attempt == 0 && !has_connected_once {
        ConnectionState::Connecting
    } else {
        ConnectionState::Reconnecting
    }
}

// Room changes made while waiting are kept for the next connection.
async fn wait_for_retry_or_disconnect(
    command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    sync: &mut SyncState,
    delay: Duration,
) -> bool {
    let retry = sleep(delay);
    tokio::pin!(retry);
    loop {
        tokio::select! {
            _ = &mut retry => return false,
            maybe_cmd = command_rx.recv() => match maybe_cmd {
                None | Some(SessionCommand::Disconnect) => return true,
                Some(command) => sync.handle_offline_command(command),
            },
        }
    }
}

fn track_changed(previous: Option<&RoomSnapshot>, next: &RoomSnapshot) -> bool {
    let track_id = |snapshot: &RoomSnapshot| snapshot.current_track.as_ref().map(|track| track.id.clone());
    previous.map(track_id) != Some(track_id(next))
}

/// The attempt number for the retry after a dropped connection. A connection that
/// stayed up for `reconnect_reset_after_secs` starts the backoff over.
pub fn next_reconnect_attempt(attempt: u32, connected_for: Duration, tuning: &SyncTuning) -> u32 {
    if connected_for >= Duration::from_secs(tuning.reconnect_reset_after_secs) {
        1
    } else {
        attempt.saturating_add(1)
    }
}

pub fn backoff_ceiling(attempt: u32, tuning: &SyncTuning) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ceiling = tuning
        .reconnect_base_ms
        .saturating_mul(1u64 << exponent)
        .min(tuning.reconnect_max_ms);
    Duration::from_millis(ceiling)
}

pub fn reconnect_delay<R: Rng + ?Sized>(attempt: u32, tuning: &SyncTuning, rng: &mut R) -> Duration {
    let ceiling = backoff_ceiling(attempt, tuning).as_millis() as u64;
    let floor = ceiling / 2;
    Duration::from_millis(rng.gen_range(floor..=ceiling))
}

fn set_connection_state(sync: &SyncState, state: ConnectionState, reason: Option<String>) {
    sync.emit(SessionEvent::Connection { state, reason });
}
