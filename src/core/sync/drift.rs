use std::collections::VecDeque;
use std::time::Duration;

use super::engine::{AudioEngine, EngineError};
use super::tolerance::{classify_gap, nudge_target, CorrectionKind};
use crate::core::config::SyncTuning;
use crate::core::room::RoomSnapshot;

pub fn expected_position_ms(
    snapshot: &RoomSnapshot,
    server_now_ms: f64,
    latency_compensation_ms: f64,
) -> f64 {
    if snapshot.current_track.is_none() {
        return 0.0;
    }
    let frozen = snapshot.elapsed_ms as f64;
    if !snapshot.is_playing {
        return frozen;
    }
    let Some(started_at) = snapshot.started_at else {
        return frozen;
    };
    let duration = snapshot.track_duration_ms() as f64;
    (server_now_ms - started_at as f64 + latency_compensation_ms).clamp(0.0, duration)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionRecord {
    pub gap_ms: f64,
    pub kind: CorrectionKind,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryTier {
    RecomputeClock = 1,
    ReloadSource = 2,
    ResetEngine = 3,
    GiveUp = 4,
}

impl RecoveryTier {
    fn from_level(level: u32) -> Option<Self> {
        match level {
            0 => None,
            1 => Some(Self::RecomputeClock),
            2 => Some(Self::ReloadSource),
            3 => Some(Self::ResetEngine),
            _ => Some(Self::GiveUp),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub gap_ms: Option<f64>,
    pub tolerance_ms: f64,
    pub kind: CorrectionKind,
    pub succeeded: bool,
    /// Tier entered on this tick. `ReloadSource` and `ResetEngine` have already been
    /// carried out; the caller handles `RecomputeClock` and `GiveUp`.
    pub escalation: Option<RecoveryTier>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncTick {
    Idle,
    Suspended,
    Ran(TickReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStateChange {
    Unchanged,
    Loaded { playing: bool },
    Started,
    Paused,
    Stopped,
}

pub struct DriftCorrector {
    tuning: SyncTuning,
    history: VecDeque<CorrectionRecord>,
    failures: u32,
    escalated: u32,
    suspended: bool,
    interval_ms: u64,
}

impl DriftCorrector {
    pub fn new(tuning: SyncTuning) -> Self {
        let interval_ms = tuning.sync_interval_ms;
        Self {
            history: VecDeque::with_capacity(tuning.history_len),
            tuning,
            failures: 0,
            escalated: 0,
            suspended: false,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn history(&self) -> impl Iterator<Item = &CorrectionRecord> {
        self.history.iter()
    }

    pub fn recent_gaps(&self) -> Vec<f64> {
        self.history.iter().map(|record| record.gap_ms).collect()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.failures = 0;
        self.escalated = 0;
        self.suspended = false;
        self.interval_ms = self.tuning.sync_interval_ms;
    }

    pub fn tick(
        &mut self,
        snapshot: &RoomSnapshot,
        server_now_ms: f64,
        tolerance_ms: f64,
        engine: &mut dyn AudioEngine,
    ) -> SyncTick {
        if self.suspended {
            return SyncTick::Suspended;
        }
        if snapshot.current_track.is_none() {
            return SyncTick::Idle;
        }

        let expected = expected_position_ms(snapshot, server_now_ms, self.tuning.output_latency_ms);
        let measured = ensure_source(snapshot, expected, engine)
            .and_then(|_| engine.position_ms())
            .and_then(|actual| {
                let gap = expected - actual;
                let kind = classify_gap(gap, tolerance_ms, self.tuning.hard_seek_multiple);
                match kind {
                    CorrectionKind::None => {}
                    CorrectionKind::Nudge => {
                        engine.seek(nudge_target(actual, expected, self.tuning.nudge_fraction))?
                    }
                    CorrectionKind::HardSeek => engine.seek(expected)?,
                }
                Ok((gap, kind))
            });

        let (gap_ms, kind, succeeded) = match measured {
            Ok((gap, kind)) => {
                let closing = self.gap_is_closing(gap, tolerance_ms);
                (Some(gap), kind, closing)
            }
            Err(err) => {
                log::warn!("drift correction failed: {err}");
                (None, CorrectionKind::None, false)
            }
        };

        if let Some(gap) = gap_ms {
            log::debug!(
                "drift {gap:.1}ms tolerance {tolerance_ms:.1}ms -> {kind:?} (interval {}ms)",
                self.interval_ms
            );
            self.push_history(CorrectionRecord {
                gap_ms: gap,
                kind,
                succeeded,
            });
        }

        let escalation = if succeeded {
            self.failures /= 2;
            self.escalated = self.escalated.min(self.level());
            None
        } else {
            self.failures = self.failures.saturating_add(1);
            self.escalate(snapshot, expected, engine)
        };
        self.adapt_interval(kind, succeeded);

        SyncTick::Ran(TickReport {
            gap_ms,
            tolerance_ms,
            kind,
            succeeded,
            escalation,
        })
    }

    pub fn sync_play_state(
        &self,
        snapshot: &RoomSnapshot,
        server_now_ms: f64,
        engine: &mut dyn AudioEngine,
    ) -> Result<PlayStateChange, EngineError> {
        if snapshot.current_track.is_none() {
            if engine.loaded_track().is_none() {
                return Ok(PlayStateChange::Unchanged);
            }
            engine.pause()?;
            engine.unload();
            return Ok(PlayStateChange::Stopped);
        }

        let expected = expected_position_ms(snapshot, server_now_ms, self.tuning.output_latency_ms);
        let should_play =
            snapshot.is_playing && expected < snapshot.track_duration_ms() as f64;

        if ensure_source(snapshot, expected, engine)? {
            if should_play {
                engine.play()?;
            }
            return Ok(PlayStateChange::Loaded {
                playing: should_play,
            });
        }

        match (should_play, engine.is_playing()) {
            (true, false) => {
                engine.play()?;
                Ok(PlayStateChange::Started)
            }
            (false, true) => {
                engine.pause()?;
                Ok(PlayStateChange::Paused)
            }
            _ => Ok(PlayStateChange::Unchanged),
        }
    }

    fn level(&self) -> u32 {
        self.failures / self.tuning.failures_per_tier.max(1)
    }

    fn gap_is_closing(&self, gap_ms: f64, tolerance_ms: f64) -> bool {
        if gap_ms.abs() <= tolerance_ms {
            return true;
        }
        match self.history.back() {
            Some(previous) if previous.kind != CorrectionKind::None => {
                gap_ms.abs() < previous.gap_ms.abs()
            }
            _ => true,
        }
    }

    fn escalate(
        &mut self,
        snapshot: &RoomSnapshot,
        expected: f64,
        engine: &mut dyn AudioEngine,
    ) -> Option<RecoveryTier> {
        let level = self.level();
        if level <= self.escalated {
            return None;
        }
        self.escalated = level;
        let tier = RecoveryTier::from_level(level)?;
        log::warn!(
            "sync escalating to {tier:?} after {} failed corrections",
            self.failures
        );

        let result = match tier {
            RecoveryTier::RecomputeClock => Ok(()),
            RecoveryTier::ReloadSource => engine.reload(),
            RecoveryTier::ResetEngine => reset_engine(snapshot, expected, engine),
            RecoveryTier::GiveUp => {
                self.suspended = true;
                Ok(())
            }
        };
        if let Err(err) = result {
            log::warn!("recovery step {tier:?} failed: {err}");
        }
        Some(tier)
    }

    fn push_history(&mut self, record: CorrectionRecord) {
        while self.history.len() >= self.tuning.history_len.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn adapt_interval(&mut self, kind: CorrectionKind, succeeded: bool) {
        const STEADY_TICKS: usize = 5;

        let min = self.tuning.sync_interval_min_ms;
        let max = self.tuning.sync_interval_max_ms.max(min);
        if kind != CorrectionKind::None || !succeeded {
            self.interval_ms = (self.interval_ms / 2).clamp(min, max);
            return;
        }

        let window = STEADY_TICKS.min(self.tuning.history_len.max(1));
        let steady = self.history.len() >= window
            && self
                .history
                .iter()
                .rev()
                .take(window)
                .all(|record| record.kind == CorrectionKind::None && record.succeeded);
        if steady {
            self.interval_ms = (self.interval_ms.saturating_mul(3) / 2).clamp(min, max);
        }
    }
}

fn ensure_source(
    snapshot: &RoomSnapshot,
    expected: f64,
    engine: &mut dyn AudioEngine,
) -> Result<bool, EngineError> {
    let Some(track) = &snapshot.current_track else {
        return Ok(false);
    };
    if engine.loaded_track().map(|loaded| loaded.id.as_str()) == Some(track.id.as_str()) {
        return Ok(false);
    }
    log::info!("loading track {} ({})", track.id, track.title);
    engine.load(track)?;
    engine.seek(expected)?;
    Ok(true)
}

fn reset_engine(
    snapshot: &RoomSnapshot,
    expected: f64,
    engine: &mut dyn AudioEngine,
) -> Result<(), EngineError> {
    let volume = engine.volume();
    let muted = engine.is_muted();
    engine.reset()?;
    engine.set_volume(volume);
    engine.set_muted(muted);
    ensure_source(snapshot, expected, engine)?;
    if snapshot.is_playing {
        engine.play()?;
    }
    Ok(())
}
