//! Process-wide monotonic clock used to stamp battery snapshots.

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since process start, offset by one so `0` stays reserved for
/// "no valid capture".
pub fn monotonic_secs() -> f64 {
    1.0 + EPOCH.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_zero() {
        let a = monotonic_secs();
        let b = monotonic_secs();
        assert!(a >= 1.0);
        assert!(b >= a);
    }
}
