//! # Net-zero estimator
//!
//! Steers inverter output against grid-consumption telemetry. Samples of
//! grid import are kept in a sliding window; each evaluation yields a signed
//! setpoint delta:
//! - two or more export samples (< 1 W) pull back immediately by
//!   `power_change_downwards`
//! - otherwise, once the window is mature, the 20th percentile of import is
//!   compared against `power_offset` with a deadband of `power_hysteresis`

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::NetZeroConfig;

/// Minimum number of samples before an upward step is considered
pub const MIN_SAMPLES: usize = 5;

#[derive(Debug)]
pub struct NetZero {
    config: NetZeroConfig,
    window: VecDeque<(Instant, i32)>,
    last_delta: i32,
}

impl NetZero {
    pub fn new(config: NetZeroConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            last_delta: 0,
        }
    }

    pub fn config(&self) -> &NetZeroConfig {
        &self.config
    }

    fn span(&self) -> Duration {
        Duration::from_secs(self.config.evaluated_time_span_s)
    }

    fn maturity(&self) -> Duration {
        Duration::from_secs(self.config.maturity_time_span_s)
    }

    /// Adds a grid power sample. Samples older than the newest accepted one are dropped.
    pub fn add(&mut self, now: Instant, grid_power: i32) {
        if let Some((newest, _)) = self.window.back() {
            if now < *newest {
                warn!(grid_power, "out-of-order consumption sample dropped");
                return;
            }
        }
        self.window.push_back((now, grid_power));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let span = self.span();
        while let Some((t, _)) = self.window.front() {
            if now.saturating_duration_since(*t) > span {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Age of the oldest retained sample
    pub fn window_age(&self, now: Instant) -> Duration {
        self.window
            .front()
            .map(|(t, _)| now.saturating_duration_since(*t))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn last_delta(&self) -> i32 {
        self.last_delta
    }

    /// Setpoint adjustment in watts; negative pulls inverter output back
    pub fn evaluate(&mut self, now: Instant) -> i32 {
        self.prune(now);
        let delta = self.compute(now);
        if delta != 0 {
            debug!(delta, samples = self.window.len(), "net-zero adjustment");
        }
        self.last_delta = delta;
        delta
    }

    fn compute(&self, now: Instant) -> i32 {
        let cfg = &self.config;

        let exporting = self.window.iter().filter(|(_, p)| *p < 1).count();
        if exporting > 1 {
            return -(cfg.power_change_downwards as i32);
        }

        if self.window.len() < MIN_SAMPLES || self.window_age(now) < self.maturity() {
            return 0;
        }

        let mut powers: Vec<i32> = self.window.iter().map(|(_, p)| *p).collect();
        powers.sort_unstable();
        let noise = powers.len() / 5;
        let m = powers[noise];

        let offset = cfg.power_offset;
        let hysteresis = cfg.power_hysteresis as i32;
        if m < offset {
            -(offset - m)
        } else if m > offset + hysteresis {
            (cfg.power_change_upwards as i32).min(m - offset - hysteresis / 2)
        } else {
            0
        }
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.last_delta = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> NetZeroConfig {
        NetZeroConfig {
            enabled: true,
            power_offset: 50,
            power_hysteresis: 20,
            power_change_upwards: 100,
            power_change_downwards: 150,
            evaluated_time_span_s: 60,
            maturity_time_span_s: 30,
        }
    }

    fn fill(nz: &mut NetZero, t0: Instant, samples: &[i32], step: Duration) -> Instant {
        let mut t = t0;
        for (i, p) in samples.iter().enumerate() {
            t = t0 + step * i as u32;
            nz.add(t, *p);
        }
        t
    }

    #[test]
    fn test_step_up() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        let end = fill(&mut nz, t0, &[200; 10], Duration::from_millis(4_444));
        let now = end.max(t0 + Duration::from_secs(40));
        assert_eq!(nz.evaluate(now), 100);
    }

    #[test]
    fn test_step_up_limited_by_residual() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        fill(&mut nz, t0, &[90; 8], Duration::from_secs(5));
        // m = 90 > 70: 90 - 50 - 10 = 30
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(35)), 30);
    }

    #[test]
    fn test_overproduction() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        fill(&mut nz, t0, &[200, -50, 180, -10, 190], Duration::from_secs(1));
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(5)), -150);
    }

    #[test]
    fn test_single_export_sample_is_tolerated() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        fill(&mut nz, t0, &[60, 0, 60, 60, 60, 60], Duration::from_secs(7));
        // 0 W is dropped as the lowest 20 %, m = 60 lies in the deadband
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(36)), 0);
    }

    #[test]
    fn test_pull_back_below_offset() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        fill(&mut nz, t0, &[20, 25, 30, 35, 40, 45], Duration::from_secs(7));
        // lowest 20 % = [20], m = 25 -> -(50 - 25)
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(40)), -25);
    }

    #[test]
    fn test_immature_window() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        fill(&mut nz, t0, &[500; 10], Duration::from_secs(1));
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(10)), 0);
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(31)), 100);
    }

    #[test]
    fn test_empty_and_cleared() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        assert_eq!(nz.evaluate(t0), 0);
        fill(&mut nz, t0, &[500; 10], Duration::from_secs(4));
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(40)), 100);
        nz.clear();
        assert_eq!(nz.last_delta(), 0);
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(41)), 0);
    }

    #[test]
    fn test_out_of_order_sample_dropped() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        nz.add(t0 + Duration::from_secs(10), 100);
        nz.add(t0 + Duration::from_secs(5), -100);
        assert_eq!(nz.len(), 1);
    }

    #[test]
    fn test_old_samples_pruned() {
        let mut nz = NetZero::new(config());
        let t0 = Instant::now();
        nz.add(t0, -10);
        nz.add(t0 + Duration::from_secs(1), -10);
        nz.add(t0 + Duration::from_secs(100), 300);
        assert_eq!(nz.len(), 1);
        assert_eq!(nz.evaluate(t0 + Duration::from_secs(100)), 0);
    }

    proptest! {
        #[test]
        fn prop_two_exports_always_pull_back(
            others in proptest::collection::vec(-2000i32..5000, 0..20),
            a in -3000i32..1,
            b in -3000i32..1,
        ) {
            let mut nz = NetZero::new(config());
            let t0 = Instant::now();
            let mut samples = others.clone();
            samples.push(a);
            samples.insert(0, b);
            let end = fill(&mut nz, t0, &samples, Duration::from_secs(1));
            prop_assert_eq!(nz.evaluate(end), -150);
        }

        #[test]
        fn prop_immature_window_holds(
            samples in proptest::collection::vec(1i32..5000, 0..29),
        ) {
            let mut nz = NetZero::new(config());
            let t0 = Instant::now();
            let end = fill(&mut nz, t0, &samples, Duration::from_secs(1));
            prop_assert_eq!(nz.evaluate(end), 0);
        }
    }
}
