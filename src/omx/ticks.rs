//! Conversions between caller durations and component ticks.

use std::time::Duration;

use crate::omx::constants::{NANOS_PER_SECOND, TICKS_PER_SECOND};

/// `value * num / denom` in 128-bit precision, saturating at `u64::MAX`.
pub fn scale(value: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let scaled = (value as u128 * num as u128) / denom as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Same as [`scale`] but rounds up.
pub fn scale_ceil(value: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let scaled = (value as u128 * num as u128).div_ceil(denom as u128);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

pub fn duration_to_ticks(d: Duration) -> i64 {
    let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
    let ticks = scale(nanos, TICKS_PER_SECOND, NANOS_PER_SECOND);
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

/// Negative tick values clamp to zero.
pub fn ticks_to_duration(ticks: i64) -> Duration {
    let ticks = u64::try_from(ticks).unwrap_or(0);
    Duration::from_nanos(scale(ticks, NANOS_PER_SECOND, TICKS_PER_SECOND))
}

pub fn duration_to_tick_count(d: Duration) -> u64 {
    let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
    scale(nanos, TICKS_PER_SECOND, NANOS_PER_SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_round_trip_at_tick_resolution() {
        let d = Duration::from_millis(33);
        assert_eq!(duration_to_ticks(d), 33_000);
        assert_eq!(ticks_to_duration(33_000), d);
    }

    #[test]
    fn sub_tick_precision_truncates() {
        assert_eq!(duration_to_ticks(Duration::from_nanos(33_366_999)), 33_366);
    }

    #[test]
    fn negative_ticks_clamp() {
        assert_eq!(ticks_to_duration(-5), Duration::ZERO);
    }

    #[test]
    fn scale_does_not_overflow() {
        assert_eq!(scale(u64::MAX, 2, 2), u64::MAX);
        assert_eq!(scale_ceil(1, 1_000_000_000, 30), 33_333_334);
    }
}
