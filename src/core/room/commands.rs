use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use super::directory::{Authenticator, DirectoryError, Principal, RoomAction, RoomDirectory};
use super::queue::next_entry;
use super::state::{InvalidTransition, RoomPlaybackState, RoomSnapshot};
use crate::core::clock::Clock;
use crate::core::events::{CommandFailure, PlaybackCommand, PlaybackEvent, PlaybackEventType};
use crate::core::hub::Broadcaster;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{user_id} is not the administrator of room {room_id}")]
    Unauthorized { user_id: String, room_id: String },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("room {0} does not exist")]
    UnknownRoom(String),
    #[error("track {track_id} is not queued in room {room_id}")]
    UnknownTrack { room_id: String, track_id: String },
    #[error("room {0} is unavailable")]
    RoomUnavailable(String),
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::UnknownRoom(_) => "unknown_room",
            Self::UnknownTrack { .. } => "unknown_track",
            Self::RoomUnavailable(_) => "unavailable",
        }
    }

    pub fn to_failure(&self) -> CommandFailure {
        CommandFailure {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }

    fn from_directory(room_id: &str, err: DirectoryError) -> Self {
        match err {
            DirectoryError::UnknownRoom(room) => Self::UnknownRoom(room),
            DirectoryError::UnknownTrack { room_id, track_id } => {
                Self::UnknownTrack { room_id, track_id }
            }
            DirectoryError::Unavailable => Self::RoomUnavailable(room_id.to_string()),
        }
    }
}

// The actor re-arms after waking early, so a capped wait still reaches the track end.
const LONGEST_TRACK_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

type CommandReply = oneshot::Sender<Result<RoomSnapshot, CommandError>>;

struct RoomRequest {
    command: PlaybackCommand,
    reply: CommandReply,
}

#[derive(Clone)]
struct RoomHandle {
    request_tx: mpsc::UnboundedSender<RoomRequest>,
    state_rx: watch::Receiver<RoomPlaybackState>,
}

#[derive(Clone)]
struct RoomContext {
    room_id: String,
    directory: Arc<dyn RoomDirectory>,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    auto_advance: bool,
}

pub struct CommandHandler {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    directory: Arc<dyn RoomDirectory>,
    authenticator: Arc<dyn Authenticator>,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    auto_advance: bool,
}

impl CommandHandler {
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        authenticator: Arc<dyn Authenticator>,
        broadcaster: Broadcaster,
        clock: Arc<dyn Clock>,
        auto_advance: bool,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            directory,
            authenticator,
            broadcaster,
            clock,
            auto_advance,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn start(
        &self,
        principal: &Principal,
        room_id: &str,
        track_id: &str,
    ) -> Result<RoomSnapshot, CommandError> {
        let command = PlaybackCommand::Start {
            track_id: track_id.to_string(),
        };
        self.execute(principal, room_id, command).await
    }

    pub async fn pause(&self, principal: &Principal, room_id: &str) -> Result<RoomSnapshot, CommandError> {
        self.execute(principal, room_id, PlaybackCommand::Pause).await
    }

    pub async fn resume(&self, principal: &Principal, room_id: &str) -> Result<RoomSnapshot, CommandError> {
        self.execute(principal, room_id, PlaybackCommand::Resume).await
    }

    pub async fn skip(&self, principal: &Principal, room_id: &str) -> Result<RoomSnapshot, CommandError> {
        self.execute(principal, room_id, PlaybackCommand::Skip).await
    }

    pub async fn stop(&self, principal: &Principal, room_id: &str) -> Result<RoomSnapshot, CommandError> {
        self.execute(principal, room_id, PlaybackCommand::Stop).await
    }

    pub async fn execute(
        &self,
        principal: &Principal,
        room_id: &str,
        command: PlaybackCommand,
    ) -> Result<RoomSnapshot, CommandError> {
        if !self.directory.room_exists(room_id) {
            return Err(CommandError::UnknownRoom(room_id.to_string()));
        }
        if !self
            .authenticator
            .authorize(principal, room_id, RoomAction::ControlPlayback)
        {
            log::warn!(
                "rejected {} from {} in room {room_id}: not administrator",
                command.name(),
                principal.user_id
            );
            return Err(CommandError::Unauthorized {
                user_id: principal.user_id.clone(),
                room_id: room_id.to_string(),
            });
        }

        let handle = self.room_handle(room_id);
        let (reply, reply_rx) = oneshot::channel();
        if handle.request_tx.send(RoomRequest { command, reply }).is_err() {
            self.lock_rooms().remove(room_id);
            return Err(CommandError::RoomUnavailable(room_id.to_string()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(CommandError::RoomUnavailable(room_id.to_string())))
    }

    pub fn room_state(&self, room_id: &str) -> Result<RoomSnapshot, CommandError> {
        let now = self.clock.now_ms();
        if let Some(handle) = self.lock_rooms().get(room_id) {
            return Ok(handle.state_rx.borrow().snapshot(room_id, now));
        }
        if self.directory.room_exists(room_id) {
            Ok(RoomSnapshot::idle(room_id, now))
        } else {
            Err(CommandError::UnknownRoom(room_id.to_string()))
        }
    }

    fn lock_rooms(&self) -> MutexGuard<'_, HashMap<String, RoomHandle>> {
        self.rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn room_handle(&self, room_id: &str) -> RoomHandle {
        let mut rooms = self.lock_rooms();
        if let Some(handle) = rooms.get(room_id) {
            if !handle.request_tx.is_closed() {
                return handle.clone();
            }
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RoomPlaybackState::idle());
        let context = RoomContext {
            room_id: room_id.to_string(),
            directory: Arc::clone(&self.directory),
            broadcaster: self.broadcaster.clone(),
            clock: Arc::clone(&self.clock),
            auto_advance: self.auto_advance,
        };
        tokio::spawn(run_room_actor(context, request_rx, state_tx));

        let handle = RoomHandle {
            request_tx,
            state_rx,
        };
        rooms.insert(room_id.to_string(), handle.clone());
        handle
    }
}

async fn run_room_actor(
    context: RoomContext,
    mut request_rx: mpsc::UnboundedReceiver<RoomRequest>,
    state_tx: watch::Sender<RoomPlaybackState>,
) {
    log::debug!("room actor for {} started", context.room_id);
    let mut state = RoomPlaybackState::idle();

    loop {
        let track_end = if context.auto_advance {
            state
                .remaining_ms(context.clock.now_ms())
                .and_then(|remaining| {
                    Instant::now().checked_add(Duration::from_millis(remaining).min(LONGEST_TRACK_WAIT))
                })
        } else {
            None
        };

        tokio::select! {
            maybe_request = request_rx.recv() => {
                let Some(request) = maybe_request else {
                    break;
                };
                let now = context.clock.now_ms();
                let result = apply_command(&context, &state, &request.command, now)
                    .map(|(next, event_type)| {
                        log::info!(
                            "room {}: {} -> {}",
                            context.room_id,
                            request.command.name(),
                            next.phase()
                        );
                        commit(&context, &mut state, &state_tx, next, event_type, now)
                    });
                let _ = request.reply.send(result);
            }
            _ = wait_until(track_end) => {
                let now = context.clock.now_ms();
                if state.remaining_ms(now) != Some(0) {
                    continue;
                }
                match advance(&context, &state, now) {
                    Ok((next, event_type)) => {
                        log::info!("room {}: track finished, advancing", context.room_id);
                        commit(&context, &mut state, &state_tx, next, event_type, now);
                    }
                    Err(err) => log::warn!("room {}: auto-advance failed: {err}", context.room_id),
                }
            }
        }
    }
    log::debug!("room actor for {} stopped", context.room_id);
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn apply_command(
    context: &RoomContext,
    state: &RoomPlaybackState,
    command: &PlaybackCommand,
    now: i64,
) -> Result<(RoomPlaybackState, PlaybackEventType), CommandError> {
    let room_id = context.room_id.as_str();
    match command {
        PlaybackCommand::Start { track_id } => {
            let track = context
                .directory
                .find_track(room_id, track_id)
                .map_err(|err| CommandError::from_directory(room_id, err))?;
            Ok((state.start(track, now), PlaybackEventType::PlaybackStarted))
        }
        PlaybackCommand::Pause => Ok((state.pause(now)?, PlaybackEventType::PlaybackPaused)),
        PlaybackCommand::Resume => Ok((state.resume(now)?, PlaybackEventType::PlaybackResumed)),
        PlaybackCommand::Skip => advance(context, state, now),
        PlaybackCommand::Stop => Ok((state.stop()?, PlaybackEventType::PlaybackStopped)),
    }
}

fn advance(
    context: &RoomContext,
    state: &RoomPlaybackState,
    now: i64,
) -> Result<(RoomPlaybackState, PlaybackEventType), CommandError> {
    let room_id = context.room_id.as_str();
    let queue = context
        .directory
        .get_queue(room_id)
        .map_err(|err| CommandError::from_directory(room_id, err))?;
    let next = next_entry(&queue, state.current_track_id()).map(|entry| entry.track.clone());
    let next_state = state.skip(next, now)?;
    let event_type = if next_state.current_track().is_some() {
        PlaybackEventType::TrackSkipped
    } else {
        PlaybackEventType::PlaybackStopped
    };
    Ok((next_state, event_type))
}

fn commit(
    context: &RoomContext,
    state: &mut RoomPlaybackState,
    state_tx: &watch::Sender<RoomPlaybackState>,
    next: RoomPlaybackState,
    event_type: PlaybackEventType,
    now: i64,
) -> RoomSnapshot {
    *state = next;
    state_tx.send_replace(state.clone());
    let snapshot = state.snapshot(&context.room_id, now);
    context
        .broadcaster
        .publish(&PlaybackEvent::new(event_type, snapshot.clone()));
    snapshot
}
