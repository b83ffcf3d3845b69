//! Capture timestamps.
//!
//! All timestamps are nanoseconds of a monotonic clock that is shared by every thread of the
//! process, so entries and exits recorded on different threads can be ordered against each other
//! and against the start of a capture.

/// Source of capture timestamps.
///
/// Implementations are called from inside the payloads and must not lock, allocate, or call back
/// into instrumented code.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The process-wide monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        now_ns()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Reads `CLOCK_MONOTONIC`. `clock_gettime` is async-signal-safe and served from the vDSO
        /// on Linux, so this does not enter the kernel on the hot path.
        #[inline(always)]
        pub fn now_ns() -> u64 {
            let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            // Cannot fail for CLOCK_MONOTONIC with a valid pointer.
            unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            (ts.tv_sec as u64)
                .wrapping_mul(1_000_000_000)
                .wrapping_add(ts.tv_nsec as u64)
        }
    } else {
        use std::sync::OnceLock;
        use std::time::Instant;

        static EPOCH: OnceLock<Instant> = OnceLock::new();

        /// Nanoseconds since the first timestamp taken in this process.
        #[inline(always)]
        pub fn now_ns() -> u64 {
            let epoch = EPOCH.get_or_init(Instant::now);
            epoch.elapsed().as_nanos() as u64
        }
    }
}
