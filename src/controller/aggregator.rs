use tokio::time::Instant;

/// Time-weighted accumulator for irregularly arriving samples.
///
/// Each sample is weighted by how long it stayed current, so chatty sources
/// do not dominate the mean. A sample only contributes once the next one
/// (or a flush) defines its duration.
#[derive(Debug, Clone, Default)]
pub struct ValueAggregator {
    last: Option<(f64, Instant)>,
    /// value x seconds
    sum: f64,
    /// seconds
    weight: f64,
}

impl ValueAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.add_at(value, Instant::now());
    }

    pub fn add_at(&mut self, value: f64, now: Instant) {
        if let Some((previous, since)) = self.last {
            let dt = now.saturating_duration_since(since).as_secs_f64();
            self.sum += previous * dt;
            self.weight += dt;
        }
        self.last = Some((value, now));
    }

    /// Closes the current sample's interval at `now` without changing the value
    pub fn flush_at(&mut self, now: Instant) {
        if let Some((value, _)) = self.last {
            self.add_at(value, now);
        }
    }

    /// Time-weighted mean; `None` before any interval is closed
    pub fn average(&self) -> Option<f64> {
        (self.weight > 0.0).then(|| self.sum / self.weight)
    }

    /// Integral in value-seconds (W -> Ws)
    pub fn integral(&self) -> f64 {
        self.sum
    }

    /// Integral converted from watt-seconds to watt-hours
    pub fn integral_wh(&self) -> f64 {
        self.sum / 3600.0
    }

    pub fn total_seconds(&self) -> f64 {
        self.weight
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last.map(|(v, _)| v)
    }

    pub fn clear(&mut self) {
        self.last = None;
        self.sum = 0.0;
        self.weight = 0.0;
    }

    /// Clears totals and restarts integration from `value` at `now`
    pub fn restart_at(&mut self, value: f64, now: Instant) {
        self.clear();
        self.last = Some((value, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_has_no_weight() {
        let mut agg = ValueAggregator::new();
        let t0 = Instant::now();
        agg.add_at(100.0, t0);
        assert_eq!(agg.average(), None);
        assert_eq!(agg.integral(), 0.0);
    }

    #[test]
    fn test_time_weighting() {
        let mut agg = ValueAggregator::new();
        let t0 = Instant::now();
        agg.add_at(100.0, t0);
        agg.add_at(0.0, t0 + Duration::from_secs(30));
        agg.add_at(0.0, t0 + Duration::from_secs(31));
        agg.add_at(0.0, t0 + Duration::from_secs(32));
        agg.add_at(50.0, t0 + Duration::from_secs(40));
        // 100 W for 30 s, 0 W for 10 s
        assert!((agg.average().unwrap() - 75.0).abs() < 1e-9);
        assert!((agg.integral() - 3000.0).abs() < 1e-9);
        agg.flush_at(t0 + Duration::from_secs(112));
        assert!((agg.integral_wh() - (3000.0 + 50.0 * 72.0) / 3600.0).abs() < 1e-9);
    }

    #[test]
    fn test_clear_and_restart() {
        let mut agg = ValueAggregator::new();
        let t0 = Instant::now();
        agg.add_at(10.0, t0);
        agg.add_at(10.0, t0 + Duration::from_secs(5));
        agg.clear();
        assert_eq!(agg.integral(), 0.0);
        assert_eq!(agg.last_value(), None);
        agg.restart_at(20.0, t0 + Duration::from_secs(6));
        agg.flush_at(t0 + Duration::from_secs(8));
        assert!((agg.integral() - 40.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_uniform_integral_is_mean_times_time(
            values in proptest::collection::vec(-5000.0f64..5000.0, 2..50),
            step_ms in 100u64..10_000,
        ) {
            let mut agg = ValueAggregator::new();
            let t0 = Instant::now();
            for (i, v) in values.iter().enumerate() {
                agg.add_at(*v, t0 + Duration::from_millis(step_ms * i as u64));
            }
            // every sample except the last has a full interval
            let closed = &values[..values.len() - 1];
            let mean = closed.iter().sum::<f64>() / closed.len() as f64;
            let total = agg.total_seconds();
            prop_assert!((agg.integral() - mean * total).abs() < 1e-6 * (1.0 + agg.integral().abs()));
            prop_assert!((agg.average().unwrap() - mean).abs() < 1e-6 * (1.0 + mean.abs()));
        }
    }
}
