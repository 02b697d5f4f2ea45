//! NTP timestamp conversions
//!
//! RTCP carries 64-bit NTP timestamps (seconds since 1900-01-01 plus a
//! 32-bit binary fraction). The conversions here map them onto the crate's
//! microsecond tick timeline, which is anchored at the Unix epoch.

use crate::time::{TimeDelta, TimeTicks};

/// Microseconds-to-fraction factor: 2^32 / 10^6
const MAGIC_FRACTIONAL_UNIT: f64 = 4.294967296E3;

/// Offset between the NTP epoch (1900) and the Unix epoch (1970), in seconds
const UNIX_EPOCH_IN_NTP_SECONDS: i64 = 2_208_988_800;

const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

/// NTP timestamp representation (64 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Binary fraction of a second
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Convert a tick value to an NTP timestamp
    pub fn from_ticks(time: TimeTicks) -> Self {
        let ntp_time_us = time.as_micros() + UNIX_EPOCH_IN_NTP_SECONDS * MICROSECONDS_PER_SECOND;
        debug_assert!(ntp_time_us >= 0);

        let seconds = ntp_time_us / MICROSECONDS_PER_SECOND;
        let fraction =
            ((ntp_time_us % MICROSECONDS_PER_SECOND) as f64 * MAGIC_FRACTIONAL_UNIT) as u32;

        Self {
            seconds: seconds as u32,
            fraction,
        }
    }

    /// Convert an NTP timestamp back to ticks
    ///
    /// The fractional part is divided with a ceiling so that a value that
    /// round-tripped through [`NtpTimestamp::from_ticks`] lands back on the
    /// original microsecond.
    pub fn to_ticks(&self) -> TimeTicks {
        let fraction_us = (f64::from(self.fraction) / MAGIC_FRACTIONAL_UNIT).ceil() as i64;
        let ntp_time_us = i64::from(self.seconds) * MICROSECONDS_PER_SECOND + fraction_us;
        TimeTicks::from_micros(
            ntp_time_us - UNIX_EPOCH_IN_NTP_SECONDS * MICROSECONDS_PER_SECOND,
        )
    }

    /// Combine into a 64-bit representation
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.seconds)) << 32 | u64::from(self.fraction)
    }

    /// Split a 64-bit representation
    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// The middle 32 bits (16 bits of seconds, 16 bits of fraction), as used
    /// by the LSR and DLSR report-block fields
    pub fn to_ntp_diff(&self) -> u32 {
        to_ntp_diff(self.seconds, self.fraction)
    }
}

/// Compress a seconds/fraction pair into the middle-32-bits form
pub fn to_ntp_diff(seconds: u32, fraction: u32) -> u32 {
    ((seconds & 0x0000_FFFF) << 16) + ((fraction & 0xFFFF_0000) >> 16)
}

/// Expand a middle-32-bits delay value into a time interval
pub fn from_ntp_diff(ntp_delay: u32) -> TimeDelta {
    let mut delay_ms = (ntp_delay & 0x0000_ffff) * 1000;
    delay_ms >>= 16;
    delay_ms += ((ntp_delay & 0xffff_0000) >> 16) * 1000;
    TimeDelta::from_millis(i64::from(delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_round_trip_within_one_microsecond() {
        for us in [0i64, 1, 999_999, 1_000_000, 1_234_567_891_234] {
            let ticks = TimeTicks::from_micros(us);
            let ntp = NtpTimestamp::from_ticks(ticks);
            let back = ntp.to_ticks();
            let diff = (back - ticks).as_micros().abs();
            assert!(diff <= 1, "round trip of {}us drifted by {}us", us, diff);
        }
    }

    #[test]
    fn test_unix_epoch_offset() {
        let ntp = NtpTimestamp::from_ticks(TimeTicks::from_micros(0));
        assert_eq!(ntp.seconds, 2_208_988_800);
        assert_eq!(ntp.fraction, 0);
    }

    #[test]
    fn test_ntp_diff_round_trip() {
        // 50ms expressed as an NTP fraction.
        let fraction = (0.050f64 * 4294967296.0) as u32;
        let diff = to_ntp_diff(0, fraction);
        let delay = from_ntp_diff(diff);
        assert_eq!(delay.as_millis(), 50);

        // Whole seconds land in the upper half.
        let diff = to_ntp_diff(3, 0);
        assert_eq!(from_ntp_diff(diff).as_millis(), 3000);
    }

    #[test]
    fn test_u64_round_trip() {
        let ntp = NtpTimestamp { seconds: 0xabcd_1234, fraction: 0x8000_0001 };
        assert_eq!(NtpTimestamp::from_u64(ntp.to_u64()), ntp);
    }
}
