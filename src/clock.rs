//! Time values derived from the Posix
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! family.
//!
//! Functions without a suffix return a number of seconds; functions with a
//! `64` suffix return a 64-bit number of nanoseconds; the `_ms` variants
//! return milliseconds, which is the unit timer deadlines are kept in.
//!
//! - [time()](fn.time.html) - wall clock time in seconds
//! - [time64()](fn.time64.html) - wall clock time in nanoseconds
//! - [time_ms()](fn.time_ms.html) - wall clock time in milliseconds
//! - [monotonic()](fn.monotonic.html) - monotonic time in seconds
//! - [monotonic64()](fn.monotonic64.html) - monotonic time in nanoseconds
//! - [monotonic_ms()](fn.monotonic_ms.html) - monotonic time in milliseconds

fn clock_gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // The only failure modes are a bad clock id or a bad pointer, neither of
    // which can happen here.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime failed");
    ts
}

/// The wall clock time in seconds.
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`. This is the best function
/// for knowing what the official time is, as determined by the system
/// administrator. It can jump backwards when the clock is stepped, which is
/// what the timer manager's rollover detection compensates for.
#[inline(always)]
pub fn time() -> f64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

/// The wall clock time in nanoseconds since epoch.
///
/// See: [time()](fn.time.html)
#[inline(always)]
pub fn time64() -> u64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The wall clock time in milliseconds since epoch.
///
/// See: [time()](fn.time.html)
#[inline(always)]
pub fn time_ms() -> u64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// The monotonic time in seconds.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`. Not affected by steps of
/// the wall clock; the best choice for measuring elapsed time.
#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic64() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_advance() {
        let t0 = monotonic64();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t1 = monotonic64();
        assert!(t1 > t0);

        let ms0 = time_ms();
        let ns0 = time64();
        // Same clock, different units.
        assert!(ns0 / 1_000_000 >= ms0);
    }

    #[test]
    fn seconds_match_millis() {
        let s = time();
        let ms = time_ms();
        assert!((s * 1_000.0 - ms as f64).abs() < 2_000.0);
    }
}
