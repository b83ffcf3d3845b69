//! Process and thread identifiers as they appear in emitted events.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

// 0 is never a valid pid or tid, so it marks "not yet captured".
static PID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static TID: Cell<u32> = const { Cell::new(0) };
}

/// Id of the current process. Queried from the OS once per process.
#[inline]
pub fn process_id() -> u32 {
    match PID.load(Ordering::Relaxed) {
        0 => {
            let pid = std::process::id();
            PID.store(pid, Ordering::Relaxed);
            pid
        }
        pid => pid,
    }
}

/// Id of the calling thread. Queried from the OS on first use per thread, cached afterwards.
#[inline]
pub fn current_thread_id() -> u32 {
    // During TLS teardown the cache is gone; fall back to asking the OS every time.
    TID.try_with(|tid| match tid.get() {
        0 => {
            let fresh = os_thread_id();
            tid.set(fresh);
            fresh
        }
        cached => cached,
    })
    .unwrap_or_else(|_| os_thread_id())
}

/// Forgets the cached ids, so they are queried again. Needed in a forked child, where both the
/// process and the surviving thread have new ids.
pub(crate) fn reset_after_fork() {
    PID.store(0, Ordering::Relaxed);
    let _ = TID.try_with(|tid| tid.set(0));
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn os_thread_id() -> u32 {
            unsafe { libc::syscall(libc::SYS_gettid) as u32 }
        }
    } else {
        use core::sync::atomic::AtomicU64;

        // Everytime we see a new thread (with empty thread-locals), we alloc our own TID.
        static TID_NEXT: AtomicU64 = AtomicU64::new(1);

        fn os_thread_id() -> u32 {
            TID_NEXT.fetch_add(1, Ordering::Relaxed) as u32
        }
    }
}
