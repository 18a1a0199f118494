use std::time::Duration;

use super::tolerance::{
    adapt_tolerance, network_tolerance, weighted_offset, ProbeSample, ToleranceParams,
};
use crate::core::config::SyncTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    Fallback,
    Bootstrap,
    Probed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOffsetEstimate {
    pub offset_ms: f64,
    pub network_latency_ms: f64,
    pub jitter_ms: f64,
    pub confidence_window_ms: f64,
    pub source: EstimateSource,
}

impl ClockOffsetEstimate {
    pub fn fallback(latency_ms: f64) -> Self {
        Self {
            offset_ms: 0.0,
            network_latency_ms: latency_ms,
            jitter_ms: 0.0,
            confidence_window_ms: latency_ms,
            source: EstimateSource::Fallback,
        }
    }

    pub fn server_time_ms(&self, local_ms: i64) -> f64 {
        local_ms as f64 + self.offset_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub probe_id: u64,
    pub client_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeProgress {
    Ignored,
    Continue,
    Completed(ClockOffsetEstimate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Completed(ClockOffsetEstimate),
    Failed { consecutive_failures: u32 },
    FellBack(ClockOffsetEstimate),
}

#[derive(Debug)]
struct ProbeRound {
    deadline_ms: i64,
    pending: Option<ProbeRequest>,
    samples: Vec<ProbeSample>,
}

#[derive(Debug)]
pub struct ClockSyncEstimator {
    tuning: SyncTuning,
    estimate: ClockOffsetEstimate,
    round: Option<ProbeRound>,
    consecutive_failures: u32,
    next_probe_id: u64,
}

impl ClockSyncEstimator {
    pub fn new(tuning: SyncTuning) -> Self {
        let estimate = ClockOffsetEstimate::fallback(tuning.fallback_latency_ms);
        Self {
            tuning,
            estimate,
            round: None,
            consecutive_failures: 0,
            next_probe_id: 1,
        }
    }

    pub fn estimate(&self) -> &ClockOffsetEstimate {
        &self.estimate
    }

    pub fn server_time_ms(&self, local_ms: i64) -> f64 {
        self.estimate.server_time_ms(local_ms)
    }

    pub fn round_in_flight(&self) -> bool {
        self.round.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Opens a probe round. Returns `false` when one is already running; the caller
    /// should try again later instead of starting a second one.
    pub fn begin_round(&mut self, local_ms: i64) -> bool {
        if self.round.is_some() {
            return false;
        }
        self.round = Some(ProbeRound {
            deadline_ms: local_ms.saturating_add(self.tuning.probe_timeout_ms as i64),
            pending: None,
            samples: Vec::with_capacity(self.tuning.probes_per_round),
        });
        true
    }

    pub fn next_probe(&mut self, local_ms: i64) -> Option<ProbeRequest> {
        let round = self.round.as_mut()?;
        if round.pending.is_some() || round.samples.len() >= self.tuning.probes_per_round {
            return None;
        }
        let request = ProbeRequest {
            probe_id: self.next_probe_id,
            client_time: local_ms,
        };
        self.next_probe_id = self.next_probe_id.wrapping_add(1);
        round.pending = Some(request);
        Some(request)
    }

    pub fn on_probe_reply(
        &mut self,
        probe_id: u64,
        server_time: i64,
        local_ms: i64,
    ) -> ProbeProgress {
        let Some(round) = self.round.as_mut() else {
            return ProbeProgress::Ignored;
        };
        let Some(pending) = round.pending else {
            return ProbeProgress::Ignored;
        };
        if pending.probe_id != probe_id {
            return ProbeProgress::Ignored;
        }

        round.pending = None;
        round.samples.push(ProbeSample::from_exchange(
            pending.client_time as f64,
            server_time as f64,
            local_ms as f64,
        ));
        if round.samples.len() < self.tuning.probes_per_round {
            return ProbeProgress::Continue;
        }

        match self.finish_round() {
            Some(estimate) => ProbeProgress::Completed(estimate),
            None => ProbeProgress::Ignored,
        }
    }

    pub fn poll_deadline(&mut self, local_ms: i64) -> Option<RoundOutcome> {
        let round = self.round.as_ref()?;
        if local_ms < round.deadline_ms {
            return None;
        }

        let enough = round.samples.len() * 2 >= self.tuning.probes_per_round;
        if enough {
            if let Some(estimate) = self.finish_round() {
                return Some(RoundOutcome::Completed(estimate));
            }
        }
        self.round = None;
        Some(self.record_failure())
    }

    pub fn cancel_round(&mut self) {
        if self.round.take().is_some() {
            log::debug!("clock probe round cancelled");
        }
    }

    pub fn bootstrap(&mut self, server_time: i64, local_ms: i64) -> bool {
        if self.estimate.source != EstimateSource::Fallback {
            return false;
        }
        let latency = self.tuning.fallback_latency_ms;
        self.estimate = ClockOffsetEstimate {
            offset_ms: server_time as f64 + latency - local_ms as f64,
            network_latency_ms: latency,
            jitter_ms: 0.0,
            confidence_window_ms: latency,
            source: EstimateSource::Bootstrap,
        };
        log::debug!(
            "bootstrapped clock offset at {:.1}ms from event time",
            self.estimate.offset_ms
        );
        true
    }

    pub fn next_round_delay(&self) -> Duration {
        let interval = Duration::from_secs(self.tuning.probe_interval_secs.max(1));
        if self.consecutive_failures == 0 {
            return interval;
        }
        let exponent = (self.consecutive_failures - 1).min(10);
        let retry = Duration::from_millis(
            self.tuning
                .probe_retry_base_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        );
        retry.min(interval)
    }

    pub fn tolerance_ms(&self, recent_gaps_ms: &[f64]) -> f64 {
        let params = tolerance_params(&self.tuning);
        let network = network_tolerance(
            self.estimate.network_latency_ms,
            self.estimate.jitter_ms,
            &params,
        );
        adapt_tolerance(network, recent_gaps_ms, &params)
    }

    fn finish_round(&mut self) -> Option<ClockOffsetEstimate> {
        let round = self.round.take()?;
        let Some(stats) = weighted_offset(&round.samples, self.tuning.probe_best_fraction) else {
            self.record_failure();
            return None;
        };

        let jitter = stats.jitter_ms();
        self.estimate = ClockOffsetEstimate {
            offset_ms: stats.offset_ms,
            network_latency_ms: stats.latency_ms,
            jitter_ms: jitter,
            confidence_window_ms: stats.latency_ms + 2.0 * jitter,
            source: EstimateSource::Probed,
        };
        self.consecutive_failures = 0;
        log::debug!(
            "clock offset {:.1}ms latency {:.1}ms jitter {:.1}ms from {} samples",
            self.estimate.offset_ms,
            self.estimate.network_latency_ms,
            jitter,
            stats.samples_used
        );
        Some(self.estimate)
    }

    fn record_failure(&mut self) -> RoundOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.tuning.probe_failure_limit {
            log::warn!(
                "clock probe round failed ({} in a row)",
                self.consecutive_failures
            );
            return RoundOutcome::Failed {
                consecutive_failures: self.consecutive_failures,
            };
        }

        log::warn!(
            "clock probing failed {} times; falling back to zero offset",
            self.consecutive_failures
        );
        self.estimate = ClockOffsetEstimate::fallback(self.tuning.fallback_latency_ms);
        RoundOutcome::FellBack(self.estimate)
    }
}

pub fn tolerance_params(tuning: &SyncTuning) -> ToleranceParams {
    ToleranceParams {
        base_ms: tuning.tolerance_base_ms,
        latency_weight: tuning.tolerance_latency_weight,
        jitter_weight: tuning.tolerance_jitter_weight,
        min_ms: tuning.tolerance_min_ms,
        max_ms: tuning.tolerance_max_ms,
        tighten_factor: tuning.tolerance_tighten_factor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(probes: usize) -> SyncTuning {
        SyncTuning {
            probes_per_round: probes,
            probe_timeout_ms: 1_000,
            probe_failure_limit: 2,
            ..SyncTuning::default()
        }
    }

    fn run_probe(
        estimator: &mut ClockSyncEstimator,
        sent_ms: i64,
        rtt_ms: i64,
        true_offset_ms: i64,
    ) -> ProbeProgress {
        let request = estimator.next_probe(sent_ms).expect("probe due");
        let received = sent_ms + rtt_ms;
        let server_time = sent_ms + rtt_ms / 2 + true_offset_ms;
        estimator.on_probe_reply(request.probe_id, server_time, received)
    }

    #[test]
    fn full_round_replaces_estimate() {
        let mut estimator = ClockSyncEstimator::new(tuning(4));
        assert_eq!(estimator.estimate().source, EstimateSource::Fallback);
        assert!(estimator.begin_round(0));

        assert_eq!(run_probe(&mut estimator, 0, 20, 5_000), ProbeProgress::Continue);
        assert_eq!(run_probe(&mut estimator, 100, 40, 5_000), ProbeProgress::Continue);
        assert_eq!(run_probe(&mut estimator, 200, 20, 5_000), ProbeProgress::Continue);
        let ProbeProgress::Completed(estimate) = run_probe(&mut estimator, 300, 60, 5_000) else {
            panic!("round should complete after the last probe");
        };

        assert_eq!(estimate.source, EstimateSource::Probed);
        assert!((estimate.offset_ms - 5_000.0).abs() < 1e-6);
        assert!((estimate.network_latency_ms - 10.0).abs() < 1e-6);
        assert!(!estimator.round_in_flight());
        assert!((estimator.server_time_ms(1_000) - 6_000.0).abs() < 1e-6);
    }

    #[test]
    fn second_round_is_deferred_while_one_is_in_flight() {
        let mut estimator = ClockSyncEstimator::new(tuning(2));
        assert!(estimator.begin_round(0));
        assert!(!estimator.begin_round(10));

        let first = estimator.next_probe(0).expect("first probe");
        assert!(estimator.next_probe(5).is_none());
        assert_eq!(
            estimator.on_probe_reply(first.probe_id + 7, 100, 20),
            ProbeProgress::Ignored
        );
    }

    #[test]
    fn cancelled_round_ignores_late_replies() {
        let mut estimator = ClockSyncEstimator::new(tuning(2));
        estimator.begin_round(0);
        let probe = estimator.next_probe(0).expect("probe");
        estimator.cancel_round();
        assert_eq!(
            estimator.on_probe_reply(probe.probe_id, 500, 20),
            ProbeProgress::Ignored
        );
        assert_eq!(estimator.estimate().source, EstimateSource::Fallback);
    }

    #[test]
    fn repeated_timeouts_fall_back_to_zero_offset() {
        let mut estimator = ClockSyncEstimator::new(tuning(4));
        estimator.bootstrap(10_000, 1_000);
        assert_eq!(estimator.estimate().source, EstimateSource::Bootstrap);

        estimator.begin_round(0);
        assert_eq!(estimator.poll_deadline(999), None);
        assert_eq!(
            estimator.poll_deadline(1_000),
            Some(RoundOutcome::Failed {
                consecutive_failures: 1
            })
        );
        assert_eq!(estimator.next_round_delay(), Duration::from_millis(1_000));

        estimator.begin_round(2_000);
        let outcome = estimator.poll_deadline(3_000).expect("deadline passed");
        let RoundOutcome::FellBack(estimate) = outcome else {
            panic!("second failure should fall back");
        };
        assert_eq!(estimate.offset_ms, 0.0);
        assert_eq!(estimate.network_latency_ms, 250.0);
        assert_eq!(estimator.next_round_delay(), Duration::from_millis(2_000));
    }

    #[test]
    fn partial_round_at_deadline_still_counts() {
        let mut estimator = ClockSyncEstimator::new(tuning(4));
        estimator.begin_round(0);
        run_probe(&mut estimator, 0, 30, -200);
        run_probe(&mut estimator, 50, 30, -200);
        estimator.next_probe(100).expect("third probe sent");

        let Some(RoundOutcome::Completed(estimate)) = estimator.poll_deadline(1_000) else {
            panic!("half a round is enough");
        };
        assert!((estimate.offset_ms + 200.0).abs() < 1e-6);
        assert_eq!(estimator.consecutive_failures(), 0);
    }

    #[test]
    fn bootstrap_never_overrides_measured_estimate() {
        let mut estimator = ClockSyncEstimator::new(tuning(1));
        estimator.begin_round(0);
        run_probe(&mut estimator, 0, 10, 42);
        assert!(!estimator.bootstrap(99_999, 0));
        assert!((estimator.estimate().offset_ms - 42.0).abs() < 1e-6);
    }
}
