use std::sync::Arc;

use thiserror::Error;

use crate::core::clock::{Clock, SystemClock};
use crate::core::room::Track;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no audio source is loaded")]
    NoSource,
    #[error("failed to load track {track_id}: {reason}")]
    Load { track_id: String, reason: String },
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("playback control failed: {0}")]
    Playback(String),
}

/// The local player the drift corrector steers. Positions are in milliseconds
/// from the start of the loaded track.
pub trait AudioEngine: Send {
    fn load(&mut self, track: &Track) -> Result<(), EngineError>;
    fn loaded_track(&self) -> Option<&Track>;
    fn unload(&mut self);
    fn position_ms(&self) -> Result<f64, EngineError>;
    fn seek(&mut self, position_ms: f64) -> Result<(), EngineError>;
    fn play(&mut self) -> Result<(), EngineError>;
    fn pause(&mut self) -> Result<(), EngineError>;
    fn is_playing(&self) -> bool;
    fn reload(&mut self) -> Result<(), EngineError>;
    fn reset(&mut self) -> Result<(), EngineError>;
    fn volume(&self) -> f32;
    fn set_volume(&mut self, volume: f32);
    fn is_muted(&self) -> bool;
    fn set_muted(&mut self, muted: bool);
}

pub struct SimulatedEngine {
    clock: Arc<dyn Clock>,
    track: Option<Track>,
    base_position_ms: f64,
    playing_since: Option<i64>,
    rate: f64,
    volume: f32,
    muted: bool,
    seek_failures: u32,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            track: None,
            base_position_ms: 0.0,
            playing_since: None,
            rate: 1.0,
            volume: 1.0,
            muted: false,
            seek_failures: 0,
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rebase();
        self.rate = rate;
    }

    pub fn fail_next_seeks(&mut self, count: u32) {
        self.seek_failures = count;
    }

    fn raw_position(&self) -> f64 {
        let running = self
            .playing_since
            .map(|since| (self.clock.now_ms() - since).max(0) as f64 * self.rate)
            .unwrap_or(0.0);
        let position = self.base_position_ms + running;
        match &self.track {
            Some(track) => position.clamp(0.0, track.duration_ms as f64),
            None => 0.0,
        }
    }

    fn rebase(&mut self) {
        self.base_position_ms = self.raw_position();
        if self.playing_since.is_some() {
            self.playing_since = Some(self.clock.now_ms());
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine for SimulatedEngine {
    fn load(&mut self, track: &Track) -> Result<(), EngineError> {
        self.track = Some(track.clone());
        self.base_position_ms = 0.0;
        self.playing_since = None;
        Ok(())
    }

    fn loaded_track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    fn unload(&mut self) {
        self.track = None;
        self.base_position_ms = 0.0;
        self.playing_since = None;
    }

    fn position_ms(&self) -> Result<f64, EngineError> {
        if self.track.is_none() {
            return Err(EngineError::NoSource);
        }
        Ok(self.raw_position())
    }

    fn seek(&mut self, position_ms: f64) -> Result<(), EngineError> {
        let Some(track) = &self.track else {
            return Err(EngineError::NoSource);
        };
        if self.seek_failures > 0 {
            self.seek_failures -= 1;
            return Err(EngineError::Seek("simulated seek failure".to_string()));
        }
        self.base_position_ms = position_ms.clamp(0.0, track.duration_ms as f64);
        if self.playing_since.is_some() {
            self.playing_since = Some(self.clock.now_ms());
        }
        Ok(())
    }

    fn play(&mut self) -> Result<(), EngineError> {
        if self.track.is_none() {
            return Err(EngineError::NoSource);
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(self.clock.now_ms());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        if self.playing_since.is_some() {
            self.base_position_ms = self.raw_position();
            self.playing_since = None;
        }
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing_since.is_some()
    }

    fn reload(&mut self) -> Result<(), EngineError> {
        let Some(track) = self.track.clone() else {
            return Err(EngineError::NoSource);
        };
        let position = self.raw_position();
        let was_playing = self.is_playing();
        self.load(&track)?;
        self.base_position_ms = position;
        if was_playing {
            self.play()?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        let clock = Arc::clone(&self.clock);
        *self = Self::with_clock(clock);
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn is_muted(&self) -> bool {
        self.muted
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }
}
