//! Exponential backoff with jitter, shared by the delivery loop's redelivery
//! schedule, the orchestrator's child-status poll cadence, and its per-step
//! retry delay.

use std::time::Duration;

use rand::Rng;

/// `base * 2^min(attempt, cap_exponent)`, jittered by ±`jitter_fraction`,
/// clamped to `[0, ceiling]`.
pub fn exponential(base: Duration, attempt: u32, cap_exponent: u32, ceiling: Duration) -> Duration {
    let exponent = attempt.min(cap_exponent);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let unjittered = base.saturating_mul(multiplier.min(u32::MAX as u64) as u32);
    let jittered = jitter(unjittered, 0.2);
    jittered.min(ceiling)
}

/// Apply ±`fraction` jitter to `d`.
pub fn jitter(d: Duration, fraction: f64) -> Duration {
    let mut rng = rand::rng();
    let factor = 1.0 + rng.random_range(-fraction..=fraction);
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_grows_and_clamps() {
        let base = Duration::from_millis(100);
        let ceiling = Duration::from_secs(5);

        let d0 = exponential(base, 0, 10, ceiling);
        assert!(d0.as_millis() >= 80 && d0.as_millis() <= 120);

        let d_large = exponential(base, 20, 10, ceiling);
        assert!(d_large <= ceiling);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(1);
        for _ in 0..50 {
            let j = jitter(base, 0.2);
            assert!(j.as_secs_f64() >= 0.79 && j.as_secs_f64() <= 1.21);
        }
    }
}
