use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SimTime
// ---------------------------------------------------------------------------

/// Integer-nanosecond simulation time.
///
/// Step sizes are derived from nanosecond counts so that `t1 - t0` does not
/// pick up floating-point drift over long runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SimTime {
    nanos: u64,
}

impl SimTime {
    pub const ZERO: Self = Self { nanos: 0 };

    /// Create a `SimTime` from a raw nanosecond count.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create a `SimTime` from seconds, rounded to the nearest nanosecond.
    ///
    /// Negative inputs saturate to zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_secs(secs: f64) -> Self {
        Self {
            nanos: (secs * 1_000_000_000.0).round().max(0.0) as u64,
        }
    }

    /// Raw nanosecond count.
    #[must_use]
    pub const fn nanos(&self) -> u64 {
        self.nanos
    }

    /// Elapsed time in seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }

    /// Returns `true` at the start of a simulation session.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.nanos == 0
    }
}

impl Add for SimTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            nanos: self.nanos + rhs.nanos,
        }
    }
}

impl Sub for SimTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            nanos: self.nanos.saturating_sub(rhs.nanos),
        }
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ---------------------------------------------------------------------------
// Step helpers
// ---------------------------------------------------------------------------

/// Step size `t1 - t0` rounded to the nanosecond.
#[must_use]
pub fn step_size(t0: f64, t1: f64) -> f64 {
    (SimTime::from_secs(t1) - SimTime::from_secs(t0)).as_secs_f64()
}

/// Whether `t0` marks the start of a simulation session.
#[must_use]
pub fn is_session_start(t0: f64) -> bool {
    SimTime::from_secs(t0).is_zero()
}

// ---------------------------------------------------------------------------
// StepClock
// ---------------------------------------------------------------------------

/// Produces `(t0, t1)` step intervals with a fixed nanosecond step.
#[derive(Debug, Clone, Copy)]
pub struct StepClock {
    now: SimTime,
    step: SimTime,
}

impl StepClock {
    /// Create a clock starting at zero with step `dt` seconds.
    #[must_use]
    pub fn new(dt: f64) -> Self {
        Self {
            now: SimTime::ZERO,
            step: SimTime::from_secs(dt),
        }
    }

    /// Current time.
    #[must_use]
    pub const fn now(&self) -> SimTime {
        self.now
    }

    /// Advance by one step and return the interval `(t0, t1)` in seconds.
    pub fn tick(&mut self) -> (f64, f64) {
        let t0 = self.now;
        self.now = self.now + self.step;
        (t0.as_secs_f64(), self.now.as_secs_f64())
    }
}
