//! Simulated-time primitives.
//!
//! All event timestamps in the simulator are nanoseconds of **virtual** time
//! carried in a [`SimTime`] newtype.  Virtual time is monotonic per host and
//! has no relationship to wall-clock time — the scheduler alone decides how
//! fast it advances.
//!
//! `SimTime::MAX` doubles as the "+∞" sentinel used by the round driver when
//! folding the minimum next-event time across workers.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Nanoseconds per microsecond.
pub const NANOS_PER_USEC: u64 = 1_000;
/// Nanoseconds per millisecond.
pub const NANOS_PER_MSEC: u64 = 1_000_000;
/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A point in simulated time, in nanoseconds since simulation start.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(u64);

impl SimTime {
    /// Simulation start.
    pub const ZERO: Self = Self(0);
    /// The "never / +∞" sentinel.
    pub const MAX: Self = Self(u64::MAX);

    /// Construct from raw nanoseconds.
    #[inline]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Construct from microseconds.
    #[inline]
    pub const fn from_usecs(usecs: u64) -> Self {
        Self(usecs * NANOS_PER_USEC)
    }

    /// Construct from milliseconds.
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * NANOS_PER_MSEC)
    }

    /// Construct from whole seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * NANOS_PER_SEC)
    }

    /// Raw nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Whole microseconds (truncating).
    #[inline]
    pub const fn as_usecs(self) -> u64 {
        self.0 / NANOS_PER_USEC
    }

    /// Whole milliseconds (truncating).
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0 / NANOS_PER_MSEC
    }

    /// `true` if this is the +∞ sentinel.
    #[inline]
    pub const fn is_max(self) -> bool {
        self.0 == u64::MAX
    }

    /// Saturating addition of a duration in nanoseconds.
    #[inline]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Elapsed nanoseconds since `earlier`, saturating at zero.
    #[inline]
    pub const fn saturating_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// The smaller of two times.
    #[inline]
    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 { self } else { other }
    }

    /// The larger of two times.
    #[inline]
    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 { self } else { other }
    }
}

impl Add<u64> for SimTime {
    type Output = SimTime;

    /// `time + nanos`.  Saturates rather than wrapping so that arithmetic
    /// against the `MAX` sentinel stays at the sentinel.
    #[inline]
    fn add(self, nanos: u64) -> SimTime {
        self.saturating_add_nanos(nanos)
    }
}

impl AddAssign<u64> for SimTime {
    #[inline]
    fn add_assign(&mut self, nanos: u64) {
        *self = *self + nanos;
    }
}

impl Sub for SimTime {
    type Output = u64;

    #[inline]
    fn sub(self, earlier: SimTime) -> u64 {
        self.saturating_since(earlier)
    }
}

impl fmt::Debug for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "SimTime(+inf)")
        } else {
            write!(f, "SimTime({}ns)", self.0)
        }
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "+inf")
        } else {
            let ms = self.0 / NANOS_PER_MSEC;
            let rem = self.0 % NANOS_PER_MSEC;
            if rem == 0 {
                write!(f, "{ms}ms")
            } else {
                write!(f, "{}ns", self.0)
            }
        }
    }
}
