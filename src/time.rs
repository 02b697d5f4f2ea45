//! Timing utilities
//!
//! All transport state machines take explicit `TimeTicks` values instead of
//! sampling a clock internally, so they stay deterministic under test. The
//! tick timeline is monotonic with microsecond resolution and is anchored at
//! the Unix epoch so NTP wall-clock values from RTCP can be mapped onto it.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A signed interval between two ticks, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TimeDelta(i64);

impl TimeDelta {
    /// The zero interval
    pub const ZERO: TimeDelta = TimeDelta(0);

    /// Create an interval from microseconds
    pub const fn from_micros(us: i64) -> Self {
        TimeDelta(us)
    }

    /// Create an interval from milliseconds
    pub const fn from_millis(ms: i64) -> Self {
        TimeDelta(ms * 1_000)
    }

    /// Create an interval from seconds
    pub const fn from_secs(secs: i64) -> Self {
        TimeDelta(secs * 1_000_000)
    }

    /// Create an interval from fractional seconds
    pub fn from_secs_f64(secs: f64) -> Self {
        TimeDelta((secs * 1_000_000.0) as i64)
    }

    /// The interval in microseconds
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// The interval in whole milliseconds (truncated toward zero)
    pub fn as_millis(&self) -> i64 {
        self.0 / 1_000
    }

    /// The interval in fractional seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Whether this is the zero interval
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.0 + rhs.0)
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        self.0 += rhs.0;
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.0 - rhs.0)
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul<i64> for TimeDelta {
    type Output = TimeDelta;

    fn mul(self, rhs: i64) -> TimeDelta {
        TimeDelta(self.0 * rhs)
    }
}

impl std::ops::Div<i64> for TimeDelta {
    type Output = TimeDelta;

    fn div(self, rhs: i64) -> TimeDelta {
        TimeDelta(self.0 / rhs)
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// A point on the monotonic tick timeline, in microseconds since the Unix
/// epoch as observed at clock construction
///
/// The zero value is reserved as "null" (never yet set), matching how the
/// protocol state machines distinguish "no report received yet" from real
/// timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TimeTicks(i64);

impl TimeTicks {
    /// Create a tick value from microseconds since the Unix epoch
    pub fn from_micros(us: i64) -> Self {
        TimeTicks(us)
    }

    /// Microseconds since the Unix epoch
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Whether this value has never been set
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl Add<TimeDelta> for TimeTicks {
    type Output = TimeTicks;

    fn add(self, rhs: TimeDelta) -> TimeTicks {
        TimeTicks(self.0 + rhs.as_micros())
    }
}

impl AddAssign<TimeDelta> for TimeTicks {
    fn add_assign(&mut self, rhs: TimeDelta) {
        self.0 += rhs.as_micros();
    }
}

impl Sub<TimeDelta> for TimeTicks {
    type Output = TimeTicks;

    fn sub(self, rhs: TimeDelta) -> TimeTicks {
        TimeTicks(self.0 - rhs.as_micros())
    }
}

impl Sub for TimeTicks {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeTicks) -> TimeDelta {
        TimeDelta::from_micros(self.0 - rhs.0)
    }
}

impl fmt::Display for TimeTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Source of monotonic ticks
///
/// Implementations must return strictly non-decreasing values with
/// microsecond resolution.
pub trait Clock: Send + Sync {
    /// The current tick value
    fn now(&self) -> TimeTicks;
}

/// A monotonic clock anchored at the Unix epoch
///
/// The wall-clock time is sampled once at construction; after that all
/// readings advance with `Instant`, so the returned ticks never go backwards
/// even if the system clock is adjusted.
pub struct MonotonicClock {
    origin: Instant,

    /// Unix time at `origin`, in microseconds
    anchor_us: i64,
}

impl MonotonicClock {
    /// Create a clock anchored at the current wall-clock time
    pub fn new() -> Self {
        let anchor_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);

        Self {
            origin: Instant::now(),
            anchor_us,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> TimeTicks {
        let elapsed = self.origin.elapsed().as_micros() as i64;
        TimeTicks::from_micros(self.anchor_us + elapsed)
    }
}

/// Exponentially-weighted estimator of the offset between two clocks
///
/// Used to smooth the measured difference between the local monotonic clock
/// and the NTP reference recovered from sender reports. The weight of each
/// new measurement grows with the time elapsed since the previous one, with
/// the time constant `tau`:
///
/// `estimate <- w * measured + (1 - w) * estimate`, `w = dt / (dt + tau)`.
pub struct ClockDriftSmoother {
    time_constant: TimeDelta,

    last_update_time: TimeTicks,

    /// Offset estimate in fractional microseconds
    estimate_us: f64,
}

impl ClockDriftSmoother {
    /// Create a smoother with the given time constant
    pub fn new(time_constant: TimeDelta) -> Self {
        debug_assert!(time_constant > TimeDelta::ZERO);
        Self {
            time_constant,
            last_update_time: TimeTicks::default(),
            estimate_us: 0.0,
        }
    }

    /// The default time constant (30 seconds)
    pub fn default_time_constant() -> TimeDelta {
        TimeDelta::from_secs(30)
    }

    /// The current offset estimate, rounded to the nearest microsecond
    pub fn current(&self) -> TimeDelta {
        TimeDelta::from_micros((self.estimate_us + 0.5).floor() as i64)
    }

    /// Whether any measurement has been recorded yet
    pub fn has_estimate(&self) -> bool {
        !self.last_update_time.is_null()
    }

    /// Discard the history and restart from `measured_offset`
    pub fn reset(&mut self, now: TimeTicks, measured_offset: TimeDelta) {
        debug_assert!(!now.is_null());
        self.last_update_time = now;
        self.estimate_us = measured_offset.as_micros() as f64;
    }

    /// Fold a new offset measurement into the estimate
    pub fn update(&mut self, now: TimeTicks, measured_offset: TimeDelta) {
        debug_assert!(!now.is_null());
        if self.last_update_time.is_null() {
            self.reset(now, measured_offset);
        } else if now < self.last_update_time {
            debug_assert!(false, "clock went backwards");
        } else {
            let elapsed_us = (now - self.last_update_time).as_micros() as f64;
            self.last_update_time = now;
            let weight = elapsed_us / (elapsed_us + self.time_constant.as_micros() as f64);
            self.estimate_us = weight * measured_offset.as_micros() as f64
                + (1.0 - weight) * self.estimate_us;
        }
    }
}
