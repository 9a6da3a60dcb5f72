//! Media clock utilities
//!
//! Converts encoder presentation timestamps into RTP clock units and RTP
//! clock offsets into wall-clock durations. Sender timestamps are kept as
//! 64-bit extended values; only the wire value wraps at 32 bits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rational time base of an encoder's presentation timestamps (seconds per unit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i64,
    pub den: i64,
}

impl TimeBase {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// The 90 kHz MPEG time base
    pub const MPEG: TimeBase = TimeBase::new(1, 90_000);

    /// Microsecond time base
    pub const MICROS: TimeBase = TimeBase::new(1, 1_000_000);

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Rescale a pts delta into units of a `clock_rate` Hz clock, rounding to nearest
    ///
    /// Returns `None` for an invalid time base or a result that does not fit.
    pub fn rescale(&self, delta: i64, clock_rate: u32) -> Option<i64> {
        if !self.is_valid() || clock_rate == 0 {
            return None;
        }
        let num = (delta as i128)
            .checked_mul(self.num as i128)?
            .checked_mul(clock_rate as i128)?;
        let den = self.den as i128;
        let half = den / 2;
        let rounded = if num >= 0 {
            num.checked_add(half)? / den
        } else {
            num.checked_sub(half)? / den
        };
        i64::try_from(rounded).ok()
    }
}

/// Wall-clock span covered by `ticks` units of a `clock_rate` Hz clock
pub fn ticks_to_duration(ticks: u64, clock_rate: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = ticks as u128 * 1_000_000_000 / clock_rate as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// RTP wire timestamp of an extended timestamp (wraps at 2^32)
pub fn wire_timestamp(extended: u64) -> u32 {
    extended as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_identity() {
        assert_eq!(TimeBase::MPEG.rescale(3003, 90_000), Some(3003));
    }

    #[test]
    fn test_rescale_ntsc_frame_rate() {
        // 1001/30000 s per frame -> 3003 ticks at 90 kHz
        let tb = TimeBase::new(1001, 30_000);
        assert_eq!(tb.rescale(1, 90_000), Some(3003));
        assert_eq!(tb.rescale(10, 90_000), Some(30_030));
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        // 1 ms at 90 kHz = 90 ticks; 1 us = 0.09 ticks
        assert_eq!(TimeBase::MICROS.rescale(1_000, 90_000), Some(90));
        assert_eq!(TimeBase::MICROS.rescale(6, 90_000), Some(1));
        assert_eq!(TimeBase::MICROS.rescale(5, 90_000), Some(0));
        assert_eq!(TimeBase::MICROS.rescale(-6, 90_000), Some(-1));
    }

    #[test]
    fn test_rescale_invalid_time_base() {
        assert_eq!(TimeBase::new(0, 1).rescale(10, 90_000), None);
        assert_eq!(TimeBase::new(1, 0).rescale(10, 90_000), None);
        assert_eq!(TimeBase::MPEG.rescale(10, 0), None);
    }

    #[test]
    fn test_rescale_out_of_range() {
        let huge = TimeBase::new(i64::MAX / 2, 1);
        assert_eq!(huge.rescale(i64::MAX / 2, 90_000), None);
        assert_eq!(huge.rescale(i64::MIN / 2, 90_000), None);
        assert_eq!(TimeBase::new(1, 1).rescale(i64::MAX, 90_000), None);
    }

    #[test]
    fn test_ticks_to_duration() {
        assert_eq!(ticks_to_duration(90_000, 90_000), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(3003, 90_000), Duration::from_nanos(33_366_666));
        assert_eq!(ticks_to_duration(5, 0), Duration::ZERO);
    }

    #[test]
    fn test_wire_timestamp_wraps() {
        assert_eq!(wire_timestamp(u32::MAX as u64), u32::MAX);
        assert_eq!(wire_timestamp(u32::MAX as u64 + 1), 0);
        assert_eq!(wire_timestamp(u32::MAX as u64 + 3004), 3003);
    }
}
