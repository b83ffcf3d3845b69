use core::sync::atomic::{AtomicU64, Ordering};

/// Start of the current capture window.
///
/// Written by the thread coordinating captures, read by every exit payload. Relaxed accesses are
/// enough: a stale value only moves the window edge by the time it takes the store to propagate.
#[derive(Debug, Default)]
pub struct CaptureSession {
    start_ns: AtomicU64,
}

impl CaptureSession {
    pub const fn new() -> CaptureSession {
        CaptureSession {
            start_ns: AtomicU64::new(0),
        }
    }

    pub fn begin(&self, now_ns: u64) {
        self.start_ns.store(now_ns, Ordering::Relaxed);
    }

    /// Timestamp the current window started at, 0 if none was started yet.
    pub fn start_ns(&self) -> u64 {
        self.start_ns.load(Ordering::Relaxed)
    }

    /// Whether the current window had already started at `timestamp_ns`.
    #[inline]
    pub fn started_before(&self, timestamp_ns: u64) -> bool {
        self.start_ns() <= timestamp_ns
    }
}
