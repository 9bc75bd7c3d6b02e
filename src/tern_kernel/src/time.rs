//! Tick-based time types.
//!
//! The kernel measures time in ticks, the period of the tick interrupt
//! (typically one millisecond). Both types wrap a 64-bit tick count, so
//! practical overflow is impossible and the arithmetic is ordinary integer
//! arithmetic.
use core::{fmt, ops};

use crate::utils::Init;

/// A span of time, measured in ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TickDuration(u64);

impl TickDuration {
    /// An empty interval.
    pub const ZERO: Self = Self(0);

    /// Construct a `TickDuration` from a tick count.
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Get the number of ticks contained by this `TickDuration`.
    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.0
    }

    /// Get a flag indicating whether the interval is empty.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Init for TickDuration {
    const INIT: Self = Self::ZERO;
}

impl fmt::Debug for TickDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ticks", self.0)
    }
}

impl ops::Add for TickDuration {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl ops::AddAssign for TickDuration {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl ops::Mul<u64> for TickDuration {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: u64) -> Self {
        Self(self.0 * rhs)
    }
}

/// A point in time, measured as the number of ticks elapsed since the
/// scheduler was started.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TickPoint(u64);

impl TickPoint {
    /// The time at which the scheduler was started.
    pub const ORIGIN: Self = Self(0);

    /// Construct a `TickPoint` from a tick count.
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Get the tick count corresponding to this `TickPoint`.
    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.0
    }

    /// Get the amount of time elapsed from `earlier` to `self`, saturating
    /// at zero.
    #[inline]
    pub const fn duration_since(self, earlier: TickPoint) -> TickDuration {
        TickDuration(self.0.saturating_sub(earlier.0))
    }
}

impl Init for TickPoint {
    const INIT: Self = Self::ORIGIN;
}

impl fmt::Debug for TickPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tick {}", self.0)
    }
}

impl ops::Add<TickDuration> for TickPoint {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TickDuration) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl ops::AddAssign<TickDuration> for TickPoint {
    #[inline]
    fn add_assign(&mut self, rhs: TickDuration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for TickPoint {
    type Output = TickDuration;

    #[inline]
    fn sub(self, rhs: Self) -> TickDuration {
        self.duration_since(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_arithmetic() {
        let d = TickDuration::from_ticks(3) + TickDuration::from_ticks(4);
        assert_eq!(d.as_ticks(), 7);
        assert_eq!((d * 3).as_ticks(), 21);
        assert!(!d.is_zero());
        assert!(TickDuration::ZERO.is_zero());
    }

    #[test]
    fn point_arithmetic() {
        let t = TickPoint::from_ticks(10) + TickDuration::from_ticks(5);
        assert_eq!(t.as_ticks(), 15);
        assert_eq!(
            t.duration_since(TickPoint::from_ticks(10)),
            TickDuration::from_ticks(5)
        );
        // `duration_since` saturates instead of wrapping around
        assert_eq!(
            TickPoint::from_ticks(10).duration_since(t),
            TickDuration::ZERO
        );
        assert_eq!(t - TickPoint::from_ticks(12), TickDuration::from_ticks(3));
    }
}
