//! Monotonic time for the runtime.
//!
//! Everything that schedules into the future — timers, reactor timeouts,
//! deadline arithmetic — is expressed in microseconds of monotonic time as
//! returned by [`now`]. Wall-clock time is deliberately not exposed: the
//! scheduler must never move backwards.

use std::time::Duration;

/// A timeout that will in practice never expire.
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The monotonic time in microseconds.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)` (`mach_absolute_time` on
/// macOS). Not affected by wall-clock adjustments; only useful for measuring
/// intervals and ordering events.
#[inline]
pub fn now() -> u64 {
    monotonic_us()
}

/// The monotonic time in seconds, as a float.
///
/// Convenience form of [`now`] for logging and coarse measurements.
#[inline]
pub fn monotonic() -> f64 {
    now() as f64 / 1_000_000.0
}

#[cfg(not(target_os = "macos"))]
fn monotonic_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

#[cfg(target_os = "macos")]
fn monotonic_us() -> u64 {
    use once_cell::sync::Lazy;

    static TIMEBASE: Lazy<libc::mach_timebase_info> = Lazy::new(|| {
        let mut info = libc::mach_timebase_info { numer: 0, denom: 0 };
        unsafe { libc::mach_timebase_info(&mut info) };
        info
    });

    let ticks = unsafe { libc::mach_absolute_time() };
    ticks * TIMEBASE.numer as u64 / TIMEBASE.denom as u64 / 1_000
}

/// Converts a relative [`Duration`] to an absolute expiry in microseconds,
/// saturating instead of overflowing for absurdly large timeouts.
#[inline]
pub(crate) fn deadline(delay: Duration) -> u64 {
    now().saturating_add(delay.as_micros().min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonicity() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn seconds_track_microseconds() {
        let us = now();
        let s = monotonic();
        assert!(s >= us as f64 / 1_000_000.0 - 1.0);
    }
}
