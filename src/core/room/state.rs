use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::queue::Track;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    Idle,
    Playing,
    Paused,
}

impl fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {command} while {phase}")]
pub struct InvalidTransition {
    pub command: &'static str,
    pub phase: PlaybackPhase,
}

/// The elapsed position is never stored. It is derived from `started_at`, which is
/// shifted forward on every resume by the length of the pause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPlaybackState {
    current_track: Option<Track>,
    is_playing: bool,
    started_at: Option<i64>,
    paused_at: Option<i64>,
}

impl RoomPlaybackState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> PlaybackPhase {
        match (&self.current_track, self.is_playing) {
            (None, _) => PlaybackPhase::Idle,
            (Some(_), true) => PlaybackPhase::Playing,
            (Some(_), false) => PlaybackPhase::Paused,
        }
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_track.as_ref()
    }

    pub fn current_track_id(&self) -> Option<&str> {
        self.current_track.as_ref().map(|track| track.id.as_str())
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    pub fn paused_at(&self) -> Option<i64> {
        self.paused_at
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        let (Some(track), Some(started_at)) = (&self.current_track, self.started_at) else {
            return 0;
        };
        let reference = match self.paused_at {
            Some(paused_at) => paused_at,
            None => now_ms,
        };
        let elapsed = u64::try_from(reference.saturating_sub(started_at)).unwrap_or(0);
        elapsed.min(track.duration_ms)
    }

    pub fn remaining_ms(&self, now_ms: i64) -> Option<u64> {
        if !self.is_playing {
            return None;
        }
        let track = self.current_track.as_ref()?;
        Some(track.duration_ms.saturating_sub(self.elapsed_ms(now_ms)))
    }

    pub fn start(&self, track: Track, now_ms: i64) -> Self {
        Self {
            current_track: Some(track),
            is_playing: true,
            started_at: Some(now_ms),
            paused_at: None,
        }
    }

    pub fn pause(&self, now_ms: i64) -> Result<Self, InvalidTransition> {
        self.require(PlaybackPhase::Playing, "pause")?;
        Ok(Self {
            current_track: self.current_track.clone(),
            is_playing: false,
            started_at: Some(self.started_at.unwrap_or(now_ms)),
            paused_at: Some(now_ms),
        })
    }

    pub fn resume(&self, now_ms: i64) -> Result<Self, InvalidTransition> {
        self.require(PlaybackPhase::Paused, "resume")?;
        let started_at = self.started_at.unwrap_or(now_ms);
        let paused_at = self.paused_at.unwrap_or(now_ms);
        let paused_for = now_ms.saturating_sub(paused_at).max(0);
        Ok(Self {
            current_track: self.current_track.clone(),
            is_playing: true,
            started_at: Some(started_at.saturating_add(paused_for)),
            paused_at: None,
        })
    }

    pub fn skip(&self, next: Option<Track>, now_ms: i64) -> Result<Self, InvalidTransition> {
        if self.phase() == PlaybackPhase::Idle {
            return Err(InvalidTransition {
                command: "skip",
                phase: PlaybackPhase::Idle,
            });
        }
        Ok(match next {
            Some(track) => self.start(track, now_ms),
            None => Self::idle(),
        })
    }

    pub fn stop(&self) -> Result<Self, InvalidTransition> {
        if self.phase() == PlaybackPhase::Idle {
            return Err(InvalidTransition {
                command: "stop",
                phase: PlaybackPhase::Idle,
            });
        }
        Ok(Self::idle())
    }

    fn require(&self, phase: PlaybackPhase, command: &'static str) -> Result<(), InvalidTransition> {
        let current = self.phase();
        if current == phase {
            Ok(())
        } else {
            Err(InvalidTransition {
                command,
                phase: current,
            })
        }
    }

    pub fn snapshot(&self, room_id: &str, now_ms: i64) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.to_string(),
            phase: self.phase(),
            current_track: self.current_track.clone(),
            is_playing: self.is_playing,
            started_at: self.started_at,
            paused_at: self.paused_at,
            elapsed_ms: self.elapsed_ms(now_ms),
            server_time: now_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub phase: PlaybackPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_track: Option<Track>,
    pub is_playing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
    pub elapsed_ms: u64,
    pub server_time: i64,
}

impl RoomSnapshot {
    pub fn idle(room_id: &str, server_time: i64) -> Self {
        RoomPlaybackState::idle().snapshot(room_id, server_time)
    }

    pub fn track_duration_ms(&self) -> u64 {
        self.current_track
            .as_ref()
            .map(|track| track.duration_ms)
            .unwrap_or(0)
    }
}
