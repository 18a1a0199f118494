use serde::{Deserialize, Serialize};

use super::room::state::RoomSnapshot;

pub const EVENT_PLAYBACK_STARTED: &str = "playback_started";
pub const EVENT_PLAYBACK_PAUSED: &str = "playback_paused";
pub const EVENT_PLAYBACK_RESUMED: &str = "playback_resumed";
pub const EVENT_TRACK_SKIPPED: &str = "track_skipped";
pub const EVENT_PLAYBACK_STOPPED: &str = "playback_stopped";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEventType {
    PlaybackStarted,
    PlaybackPaused,
    PlaybackResumed,
    TrackSkipped,
    PlaybackStopped,
}

impl PlaybackEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlaybackStarted => EVENT_PLAYBACK_STARTED,
            Self::PlaybackPaused => EVENT_PLAYBACK_PAUSED,
            Self::PlaybackResumed => EVENT_PLAYBACK_RESUMED,
            Self::TrackSkipped => EVENT_TRACK_SKIPPED,
            Self::PlaybackStopped => EVENT_PLAYBACK_STOPPED,
        }
    }
}

/// One state transition. `data` is always the complete new room state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub event_type: PlaybackEventType,
    pub room_id: String,
    pub data: RoomSnapshot,
    pub server_time: i64,
}

impl PlaybackEvent {
    pub fn new(event_type: PlaybackEventType, data: RoomSnapshot) -> Self {
        Self {
            event_type,
            room_id: data.room_id.clone(),
            server_time: data.server_time,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlaybackCommand {
    Start { track_id: String },
    Pause,
    Resume,
    Skip,
    Stop,
}

impl PlaybackCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Skip => "skip",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        credential: String,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom,
    Command {
        request_id: u64,
        command: PlaybackCommand,
    },
    TimeProbe {
        probe_id: u64,
        client_time: i64,
    },
    GetRoomState,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandFailure {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        user_id: String,
    },
    Joined {
        room_id: String,
        state: RoomSnapshot,
    },
    Left {
        room_id: String,
    },
    Playback {
        event: PlaybackEvent,
    },
    CommandResult {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<RoomSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CommandFailure>,
    },
    TimeProbe {
        probe_id: u64,
        client_time: i64,
        server_time: i64,
    },
    RoomState {
        state: RoomSnapshot,
    },
    Pong {
        server_time: i64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn server_time(&self) -> Option<i64> {
        match self {
            Self::Joined { state, .. } | Self::RoomState { state } => Some(state.server_time),
            Self::Playback { event } => Some(event.server_time),
            Self::TimeProbe { server_time, .. } | Self::Pong { server_time } => Some(*server_time),
            Self::CommandResult { state, .. } => state.as_ref().map(|state| state.server_time),
            Self::Authenticated { .. } | Self::Left { .. } | Self::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeResponse {
    pub server_time: i64,
}
