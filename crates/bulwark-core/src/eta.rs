/// One finished backup's timing, kept in the duration history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationSample {
    pub indexing_time_ms: i64,
    pub duration_ms: i64,
}

/// Exponentially smoothed transfer-speed estimate used for progress ETAs.
///
/// The first sample bootstraps the estimate; afterwards
/// `est = 0.9 * est + 0.1 * sample`.
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    speed_bpms: f64,
    last_received_bytes: i64,
    last_sample_ms: i64,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a progress tick at `now_ms` with the cumulative byte count
    /// (transferred plus hash-linked). Returns the ETA in seconds for
    /// `total_expected_bytes`, or `None` until two ticks have been seen.
    pub fn tick(&mut self, now_ms: i64, received_bytes: i64, total_expected_bytes: i64) -> Option<i64> {
        let new_bytes = received_bytes - self.last_received_bytes;
        let passed_ms = now_ms - self.last_sample_ms;
        self.last_sample_ms = now_ms;

        if passed_ms <= 0 {
            return None;
        }
        let sample = new_bytes as f64 / passed_ms as f64;

        if self.speed_bpms == 0.0 {
            self.speed_bpms = sample;
        } else {
            self.speed_bpms = self.speed_bpms * 0.9 + sample * 0.1;
        }

        let had_prior = self.last_received_bytes > 0;
        self.last_received_bytes = received_bytes;

        if !had_prior || self.speed_bpms <= 0.0 {
            return None;
        }
        let remaining = (total_expected_bytes - received_bytes).max(0) as f64;
        Some((remaining / self.speed_bpms / 1000.0 + 0.5) as i64)
    }

    pub fn speed_bpms(&self) -> f64 {
        self.speed_bpms
    }
}

/// Compose a prior estimate for the next backup from the duration history,
/// smoothing newest to oldest with the same 0.9/0.1 weights.
pub fn interpolate_durations(durations: &[DurationSample]) -> DurationSample {
    let mut duration = 0.0f64;
    let mut indexing = 0.0f64;

    if let Some(last) = durations.last() {
        duration = last.duration_ms as f64;
        indexing = last.indexing_time_ms as f64;
    }

    if durations.len() > 1 {
        for sample in durations[..durations.len() - 1].iter().rev() {
            duration = 0.9 * duration + 0.1 * sample.duration_ms as f64;
            indexing = 0.9 * indexing + 0.1 * sample.indexing_time_ms as f64;
        }
    }

    DurationSample {
        indexing_time_ms: (indexing + 0.5) as i64,
        duration_ms: (duration + 0.5) as i64,
    }
}
