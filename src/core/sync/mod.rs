pub mod drift;
pub mod engine;
pub mod estimator;
pub mod session;
pub mod tolerance;

pub use drift::{expected_position_ms, DriftCorrector, PlayStateChange, RecoveryTier, SyncTick};
pub use engine::{AudioEngine, EngineError, SimulatedEngine};
pub use estimator::{
    ClockOffsetEstimate, ClockSyncEstimator, EstimateSource, ProbeProgress, ProbeRequest, RoundOutcome,
};
pub use session::{ConnectionState, ListenerSession, SessionError, SessionEvent, SessionEvents};
pub use tolerance::CorrectionKind;
