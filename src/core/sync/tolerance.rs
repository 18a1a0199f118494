#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    pub rtt_ms: f64,
    /// Server clock minus local clock, assuming the reply spent half the round trip in flight.
    pub offset_ms: f64,
}

impl ProbeSample {
    pub fn from_exchange(local_sent_ms: f64, server_ms: f64, local_received_ms: f64) -> Self {
        let rtt_ms = (local_received_ms - local_sent_ms).max(0.0);
        Self {
            rtt_ms,
            offset_ms: server_ms + rtt_ms / 2.0 - local_received_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetStats {
    pub offset_ms: f64,
    pub latency_ms: f64,
    pub variance_ms2: f64,
    pub samples_used: usize,
}

impl OffsetStats {
    pub fn jitter_ms(&self) -> f64 {
        self.variance_ms2.max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceParams {
    pub base_ms: f64,
    pub latency_weight: f64,
    pub jitter_weight: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub tighten_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionKind {
    None,
    Nudge,
    HardSeek,
}

pub fn weighted_offset(samples: &[ProbeSample], best_fraction: f64) -> Option<OffsetStats> {
    let mut usable = samples
        .iter()
        .copied()
        .filter(|sample| sample.rtt_ms.is_finite() && sample.offset_ms.is_finite())
        .collect::<Vec<_>>();
    if usable.is_empty() {
        return None;
    }
    usable.sort_by(|left, right| left.rtt_ms.total_cmp(&right.rtt_ms));

    let keep = ((usable.len() as f64) * best_fraction.clamp(0.0, 1.0)).ceil() as usize;
    usable.truncate(keep.max(1));

    let weights = usable
        .iter()
        .map(|sample| 1.0 / sample.rtt_ms.max(1.0))
        .collect::<Vec<_>>();
    let total_weight = weights.iter().sum::<f64>();

    let offset_ms = usable
        .iter()
        .zip(&weights)
        .map(|(sample, weight)| sample.offset_ms * weight)
        .sum::<f64>()
        / total_weight;
    let latency_ms = usable
        .iter()
        .zip(&weights)
        .map(|(sample, weight)| (sample.rtt_ms / 2.0) * weight)
        .sum::<f64>()
        / total_weight;
    let variance_ms2 = usable
        .iter()
        .zip(&weights)
        .map(|(sample, weight)| {
            let delta = sample.offset_ms - offset_ms;
            delta * delta * weight
        })
        .sum::<f64>()
        / total_weight;

    Some(OffsetStats {
        offset_ms,
        latency_ms,
        variance_ms2,
        samples_used: usable.len(),
    })
}

pub fn network_tolerance(latency_ms: f64, jitter_ms: f64, params: &ToleranceParams) -> f64 {
    let raw = params.base_ms
        + params.latency_weight * latency_ms.max(0.0)
        + params.jitter_weight * jitter_ms.max(0.0);
    raw.clamp(params.min_ms, params.max_ms)
}

pub fn adapt_tolerance(network_ms: f64, recent_gaps_ms: &[f64], params: &ToleranceParams) -> f64 {
    const MIN_HISTORY: usize = 3;

    if recent_gaps_ms.len() < MIN_HISTORY {
        return network_ms.clamp(params.min_ms, params.max_ms);
    }

    let magnitudes = recent_gaps_ms.iter().map(|gap| gap.abs()).collect::<Vec<_>>();
    let mean = magnitudes.iter().sum::<f64>() / magnitudes.len() as f64;
    let spread = (magnitudes
        .iter()
        .map(|gap| (gap - mean) * (gap - mean))
        .sum::<f64>()
        / magnitudes.len() as f64)
        .sqrt();

    let all_small = magnitudes.iter().all(|gap| *gap <= network_ms * 0.5);
    let consistent = spread <= network_ms * 0.25;
    let adapted = if all_small && consistent {
        network_ms * params.tighten_factor
    } else {
        network_ms
    };
    adapted.clamp(params.min_ms, params.max_ms)
}

pub fn classify_gap(gap_ms: f64, tolerance_ms: f64, hard_seek_multiple: f64) -> CorrectionKind {
    let magnitude = gap_ms.abs();
    if magnitude <= tolerance_ms {
        CorrectionKind::None
    } else if magnitude > tolerance_ms * hard_seek_multiple {
        CorrectionKind::HardSeek
    } else {
        CorrectionKind::Nudge
    }
}

pub fn nudge_target(actual_ms: f64, expected_ms: f64, fraction: f64) -> f64 {
    actual_ms + (expected_ms - actual_ms) * fraction.clamp(0.0, 1.0)
}
