//! Presentation time for packets and segments.
//!
//! [`ClockTime`] is a nanosecond count relative to the first packet of a
//! stream. RTP timestamps are converted into it through the stream's clock
//! rate (see [`ClockTime::from_rtp_ticks`]).

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Time in nanoseconds (8 bytes, Copy).
///
/// `ClockTime::NONE` marks an unset timestamp.
///
/// ```rust
/// use graphbridge::clock::ClockTime;
///
/// let t = ClockTime::from_millis(1_500);
/// assert_eq!(format!("{}", t), "1.500s");
/// assert_eq!(ClockTime::from_rtp_ticks(90_000, 90_000), ClockTime::from_secs(1));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Invalid/unset time (sentinel value).
    pub const NONE: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(NANOS_PER_SEC))
    }

    /// Convert a tick count at `clock_rate` Hz into time.
    ///
    /// Returns `NONE` for a zero clock rate.
    pub fn from_rtp_ticks(ticks: u64, clock_rate: u32) -> Self {
        if clock_rate == 0 {
            return Self::NONE;
        }
        let nanos = (ticks as u128 * NANOS_PER_SEC as u128) / clock_rate as u128;
        Self(nanos.min((u64::MAX - 1) as u128) as u64)
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / NANOS_PER_SEC
    }

    /// Check if this is the NONE sentinel value.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check if this is a valid time (not NONE).
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}.{:03}s", self.secs(), self.millis() % 1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_tick_conversion() {
        assert_eq!(ClockTime::from_rtp_ticks(45_000, 90_000), ClockTime::from_millis(500));
        assert_eq!(ClockTime::from_rtp_ticks(960, 48_000), ClockTime::from_millis(20));
        assert!(ClockTime::from_rtp_ticks(1, 0).is_none());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(ClockTime::NONE.is_none());
        assert!(ClockTime::ZERO.is_some());
        assert!(ClockTime::from_secs(1) < ClockTime::NONE);
        assert_eq!(ClockTime::from_rtp_ticks(u64::MAX, 1), ClockTime::from_nanos(u64::MAX - 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(ClockTime::from_millis(2_040).to_string(), "2.040s");
        assert_eq!(ClockTime::NONE.to_string(), "NONE");
    }
}
