use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};

use log::{error, warn};

use crate::clock::{self, Clock, MonotonicClock};
use crate::config::RelayConfig;
use crate::interface::{FunctionEntry, FunctionExit, OpenCall};
use crate::relay::{CaptureStartHook, EventRelay};
use crate::retstack::{suppress_instrumentation, with_retstack, ReentrancyGuard, RetStack};
use crate::session::CaptureSession;
use crate::thread::{current_thread_id, process_id};
use crate::transport::Connector;

type RelayFactory = Box<dyn Fn(CaptureStartHook) -> EventRelay + Send + Sync>;

/// The entry and exit payloads, and the process-wide state they share.
///
/// Per-thread state (open calls, reentrancy flag, thread id) is not part of the tracer: it lives
/// in thread-locals and is shared by every tracer used on a thread.
pub struct Tracer<C: Clock = MonotonicClock> {
    clock: Arc<C>,
    session: Arc<CaptureSession>,
    relay: OnceLock<EventRelay>,
    make_relay: RelayFactory,
}

impl Tracer<MonotonicClock> {
    /// Tracer that connects to the collector named by the `FNTRACE_*` environment variables,
    /// the first time the relay is needed.
    pub fn from_env() -> Self {
        Tracer::new(MonotonicClock, |on_capture_start| {
            let config = RelayConfig::from_env().unwrap_or_else(|e| {
                warn!("Ignoring relay configuration from environment: {}", e);
                RelayConfig::default()
            });
            connect_relay(&config, on_capture_start)
        })
    }
}

impl<C: Clock + 'static> Tracer<C> {
    /// `make_relay` runs once, on first use of the relay. The relay it builds must call the hook
    /// it is given whenever a capture starts, e.g. by passing it to
    /// [`EventRelay::start_with_hook`].
    pub fn new(
        clock: C,
        make_relay: impl Fn(CaptureStartHook) -> EventRelay + Send + Sync + 'static,
    ) -> Self {
        Tracer {
            clock: Arc::new(clock),
            session: Arc::new(CaptureSession::new()),
            relay: OnceLock::new(),
            make_relay: Box::new(make_relay),
        }
    }

    /// Tracer whose relay is started right away over `connector`.
    pub fn start(
        clock: C,
        connector: Box<dyn Connector>,
        config: &RelayConfig,
    ) -> io::Result<Self> {
        let capacity = config.capacity;
        let tracer = Tracer::new(clock, move |_| EventRelay::closed(capacity));
        let relay = EventRelay::start_with_hook(connector, config, tracer.capture_start_hook())?;
        // Freshly created, so this cannot already be set.
        let _ = tracer.relay.set(relay);
        Ok(tracer)
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    /// The relay, created on first call. Later calls return the same instance.
    #[inline]
    pub fn relay(&self) -> &EventRelay {
        self.relay
            .get_or_init(|| (self.make_relay)(self.capture_start_hook()))
    }

    /// Opens the capture window at the current time when the collector starts a capture.
    fn capture_start_hook(&self) -> CaptureStartHook {
        let clock = Arc::clone(&self.clock);
        let session = Arc::clone(&self.session);
        Box::new(move || session.begin(clock.now_ns()))
    }

    /// Opens a capture window at `now_ns`. Also brings up the relay, so its connection exists
    /// before the first instrumented call of the capture.
    ///
    /// Captures started by the collector open their window on their own. This is for a
    /// coordinator that needs the window to start at a specific time.
    pub fn begin_capture(&self, now_ns: u64) {
        self.session.begin(now_ns);
        self.relay();
    }

    /// Entry payload.
    ///
    /// Remembers the call, reports it if a capture is running and redirects the function's return
    /// to `return_trampoline_address`. Does nothing at all when called from within another
    /// payload on the same thread.
    ///
    /// # Safety
    ///
    /// `stack_pointer` must point at the writable, pointer-sized slot holding the return address
    /// of the instrumented function, and that slot must contain `return_address`.
    /// `return_trampoline_address` must be the exit trampoline, which calls [`Tracer::on_exit`] on
    /// the same thread and jumps to the address it returns.
    #[inline]
    pub unsafe fn on_entry(
        &self,
        return_address: u64,
        function_id: u64,
        stack_pointer: u64,
        return_trampoline_address: u64,
    ) {
        let Some(_guard) = ReentrancyGuard::try_enter() else {
            return;
        };
        self.record_entry(
            return_address,
            function_id,
            stack_pointer,
            return_trampoline_address,
        );
    }

    /// Entry payload body. The caller holds the (non-nested) reentrancy guard.
    #[inline]
    unsafe fn record_entry(
        &self,
        return_address: u64,
        function_id: u64,
        stack_pointer: u64,
        return_trampoline_address: u64,
    ) {
        let timestamp_ns = self.clock.now_ns();

        let call = OpenCall {
            return_address,
            timestamp_ns,
        };
        // Without a stack to remember the call on we must not hook its return either.
        if with_retstack(|stack| stack.push(call)).is_none() {
            return;
        }

        let relay = self.relay();
        if relay.is_capturing() {
            relay.enqueue(
                FunctionEntry {
                    process_id: process_id(),
                    thread_id: current_thread_id(),
                    function_id,
                    stack_pointer,
                    return_address,
                    timestamp_ns,
                }
                .into(),
            );
        }

        (stack_pointer as usize as *mut usize).write(return_trampoline_address as usize);
    }

    /// Exit payload. Returns where the function that just returned into the exit trampoline was
    /// originally going to return to.
    ///
    /// The exit is only reported if its entry happened inside the current capture window, so
    /// every reported exit has a reported entry.
    #[inline]
    pub fn on_exit(&self) -> u64 {
        let guard = ReentrancyGuard::enter();
        if guard.is_nested() {
            // The trampoline still needs the address.
            return pop_open_call().return_address;
        }
        self.record_exit()
    }

    /// Exit payload body. The caller holds the (non-nested) reentrancy guard.
    #[inline]
    fn record_exit(&self) -> u64 {
        let timestamp_ns = self.clock.now_ns();
        let call = pop_open_call();

        let relay = self.relay();
        if relay.is_capturing() && self.session.started_before(call.timestamp_ns) {
            relay.enqueue(
                FunctionExit {
                    process_id: process_id(),
                    thread_id: current_thread_id(),
                    timestamp_ns,
                }
                .into(),
            );
        }

        call.return_address
    }

    /// Shuts the relay down, if it was ever started. Call once no thread runs payloads anymore.
    pub fn shutdown(&self) {
        if let Some(relay) = self.relay.get() {
            relay.shutdown();
        }
    }
}

impl<C: Clock + fmt::Debug> fmt::Debug for Tracer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("clock", &self.clock)
            .field("session", &self.session)
            .field("relay", &self.relay.get())
            .finish()
    }
}

#[inline]
fn pop_open_call() -> OpenCall {
    match with_retstack(RetStack::pop) {
        Some(Some(call)) => call,
        _ => unbalanced_exit(),
    }
}

/// An exit without a matching entry means the trampolines are out of sync with the payloads, and
/// we cannot know where to return to.
#[cold]
fn unbalanced_exit() -> ! {
    std::process::abort()
}

fn connect_relay(config: &RelayConfig, on_capture_start: CaptureStartHook) -> EventRelay {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let connector = crate::transport::unix::UnixSocketConnector::new(&config.socket_path);
            EventRelay::start_with_hook(Box::new(connector), config, on_capture_start)
                .unwrap_or_else(|e| {
                    error!("Could not start relay worker: {}", e);
                    EventRelay::closed(config.capacity)
                })
        } else {
            drop(on_capture_start);
            error!("No collector transport on this platform, events will not be recorded");
            EventRelay::closed(config.capacity)
        }
    }
}

static TRACER: OnceLock<Tracer> = OnceLock::new();

/// The tracer used by the exported payloads.
///
/// Its first call sets up the fork handler and may log, so it must run with instrumentation
/// suppressed on the calling thread.
pub fn tracer() -> &'static Tracer {
    TRACER.get_or_init(|| {
        install_fork_handler();
        Tracer::from_env()
    })
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn install_fork_handler() {
            extern "C" fn after_fork_in_child() {
                crate::thread::reset_after_fork();
                if let Some(relay) = TRACER.get().and_then(|tracer| tracer.relay.get()) {
                    relay.close_after_fork();
                }
            }

            let ret = unsafe { libc::pthread_atfork(None, None, Some(after_fork_in_child)) };
            if ret != 0 {
                warn!("Could not register fork handler, forked children may report stale ids");
            }
        }
    } else {
        fn install_fork_handler() {}
    }
}

// Interface towards the trampolines and the capture coordinator. Each takes the reentrancy guard
// before touching the process-wide tracer.

#[no_mangle]
pub extern "C" fn fntrace_begin_capture(now_ns: u64) {
    let _suppressed = suppress_instrumentation();
    tracer().begin_capture(now_ns);
}

/// # Safety
///
/// See [`Tracer::on_entry`].
#[no_mangle]
pub unsafe extern "C" fn fntrace_entry_payload(
    return_address: u64,
    function_id: u64,
    stack_pointer: u64,
    return_trampoline_address: u64,
) {
    let Some(_guard) = ReentrancyGuard::try_enter() else {
        return;
    };
    tracer().record_entry(
        return_address,
        function_id,
        stack_pointer,
        return_trampoline_address,
    );
}

#[no_mangle]
pub extern "C" fn fntrace_exit_payload() -> u64 {
    let guard = ReentrancyGuard::enter();
    if guard.is_nested() {
        return pop_open_call().return_address;
    }
    tracer().record_exit()
}

#[no_mangle]
pub extern "C" fn fntrace_now_ns() -> u64 {
    clock::now_ns()
}

#[no_mangle]
pub extern "C" fn fntrace_shutdown() {
    let _suppressed = suppress_instrumentation();
    if let Some(tracer) = TRACER.get() {
        tracer.shutdown();
    }
}
