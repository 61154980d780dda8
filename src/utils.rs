//! Small time helpers shared by the service, stores and notifiers.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Whole seconds from `start` to `end`, clamped at zero.
pub fn secs_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_seconds().max(0) as u64
}

/// Fractional seconds from `start` to `end`, clamped at zero.
pub fn secs_between_f64(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds().max(0) as f64) / 1000.0
}

/// `at + delay`, saturating instead of overflowing.
pub fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - window`, saturating instead of underflowing.
pub fn sub_duration(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_between_clamps() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(2500);
        assert_eq!(secs_between(now, later), 2);
        assert_eq!(secs_between(later, now), 0);
        assert_eq!(secs_between_f64(now, later), 2.5);
    }

    #[test]
    fn test_add_sub_duration() {
        let now = Utc::now();
        let later = add_duration(now, Duration::from_secs(3));
        assert_eq!(secs_between(now, later), 3);
        assert_eq!(sub_duration(later, Duration::from_secs(3)), now);
    }
}
