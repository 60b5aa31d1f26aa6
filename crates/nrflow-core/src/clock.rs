//! Monotonic timestamps comparable across processes.
//!
//! `std::time::Instant` cannot be written into shared memory, so block
//! timestamps use raw `CLOCK_MONOTONIC` nanoseconds.

/// Nanoseconds on the system monotonic clock
#[must_use]
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into the timespec we own; CLOCK_MONOTONIC
    // is always available on the supported platforms.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_nanos_advances() {
        let a = monotonic_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_nanos();
        assert!(b > a);
        assert!(b - a >= 1_000_000);
    }
}
