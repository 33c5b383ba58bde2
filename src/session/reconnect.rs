//! Reconnect backoff.
//!
//! Delay formula: `min(base_delay_ms * 2^attempt + jitter, max_delay_ms)`.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Compute the backoff delay for a given attempt (0-indexed).
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

/// Jitter in `[0, base_delay_ms)` taken from the clock's nanosecond
/// component, enough to spread out sessions that dropped together.
fn jitter_ms(base_delay_ms: u64) -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % base_delay_ms.max(1))
        .unwrap_or(0)
}

/// Delay before reconnect attempt `attempt`.
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    Duration::from_millis(compute_delay(
        attempt,
        config.base_delay_ms,
        config.max_delay_ms,
        jitter_ms(config.base_delay_ms),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        assert_eq!(compute_delay(0, 500, 15_000, 0), 500);
        assert_eq!(compute_delay(1, 500, 15_000, 0), 1000);
        assert_eq!(compute_delay(3, 500, 15_000, 0), 4000);
    }

    #[test]
    fn test_delay_with_jitter() {
        assert_eq!(compute_delay(1, 500, 15_000, 120), 1120);
    }

    #[test]
    fn test_delay_capped_at_max() {
        assert_eq!(compute_delay(10, 500, 15_000, 0), 15_000);
        assert_eq!(compute_delay(10, 500, 15_000, 499), 15_000);
        assert_eq!(compute_delay(u32::MAX, 500, 15_000, 0), 15_000);
    }

    #[test]
    fn test_backoff_delay_within_bounds() {
        let config = ReconnectConfig::default();
        for attempt in 0..8 {
            let d = backoff_delay(attempt, &config).as_millis() as u64;
            let floor = compute_delay(attempt, config.base_delay_ms, config.max_delay_ms, 0);
            assert!(d >= floor);
            assert!(d <= config.max_delay_ms);
        }
    }
}
