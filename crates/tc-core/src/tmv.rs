//! Signed nanosecond time values.
//!
//! All residence and delay arithmetic in the crate happens on [`Tmv`], a
//! plain `i64` nanosecond count. Conversions exist to and from the on-wire
//! PTP `TimeInterval` (nanoseconds scaled by 2^16) and `timespec` pairs.

use std::ops::{Add, Div, Neg, Sub};

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A signed duration or point on the monotonic clock, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tmv(i64);

impl Tmv {
    pub const ZERO: Tmv = Tmv(0);

    #[inline]
    pub fn from_nanos(ns: i64) -> Tmv {
        Tmv(ns)
    }

    #[inline]
    pub fn nanos(self) -> i64 {
        self.0
    }

    /// `s * 1e9 + ns`.
    #[inline]
    pub fn from_timespec(sec: i64, nsec: i64) -> Tmv {
        Tmv(sec * NSEC_PER_SEC + nsec)
    }

    /// Splits back into `(sec, nsec)`. Inverse of [`Tmv::from_timespec`] for
    /// non-negative values.
    #[inline]
    pub fn to_timespec(self) -> (i64, i64) {
        (self.0 / NSEC_PER_SEC, self.0 % NSEC_PER_SEC)
    }

    /// Converts to the PTP `TimeInterval` wire scale (nanoseconds × 2^16).
    #[inline]
    pub fn to_time_interval(self) -> i64 {
        self.0 << 16
    }

    /// Converts a wire `TimeInterval` back to whole nanoseconds, discarding
    /// the fractional part.
    #[inline]
    pub fn from_time_interval(ti: i64) -> Tmv {
        Tmv(ti >> 16)
    }
}

impl Add for Tmv {
    type Output = Tmv;
    #[inline]
    fn add(self, rhs: Tmv) -> Tmv {
        Tmv(self.0 + rhs.0)
    }
}

impl Sub for Tmv {
    type Output = Tmv;
    #[inline]
    fn sub(self, rhs: Tmv) -> Tmv {
        Tmv(self.0 - rhs.0)
    }
}

impl Neg for Tmv {
    type Output = Tmv;
    #[inline]
    fn neg(self) -> Tmv {
        Tmv(-self.0)
    }
}

impl Div<i64> for Tmv {
    type Output = Tmv;
    /// Integer division, truncating toward zero.
    #[inline]
    fn div(self, rhs: i64) -> Tmv {
        Tmv(self.0 / rhs)
    }
}

/// Current monotonic time. `CLOCK_MONOTONIC` on unix; an `Instant`-based
/// fallback elsewhere.
pub fn now() -> Tmv {
    #[cfg(unix)]
    {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Tmv::from_timespec(ts.tv_sec as i64, ts.tv_nsec as i64)
    }
    #[cfg(not(unix))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        Tmv::from_nanos(epoch.elapsed().as_nanos() as i64)
    }
}
