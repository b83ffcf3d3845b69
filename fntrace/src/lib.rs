//! Runtime payload of a function tracer.
//!
//! Instrumented functions are patched so that their entry calls [`fntrace_entry_payload`], which
//! records the call and replaces the function's return address with an exit trampoline. The exit
//! trampoline calls [`fntrace_exit_payload`] to record the return and to learn where to jump to.
//! Records are buffered without blocking and forwarded to an out-of-process collector by a
//! background thread, but only while the collector has a capture running.

mod clock;
mod thread;

pub mod config;
pub mod error;
pub mod interface;
pub mod relay;
pub mod retstack;
pub mod session;
pub mod transport;
pub mod wire;

mod backend;

#[cfg(test)]
mod testing;

pub use backend::{
    fntrace_begin_capture, fntrace_entry_payload, fntrace_exit_payload, fntrace_now_ns,
    fntrace_shutdown, tracer, Tracer,
};
pub use clock::{now_ns, Clock, MonotonicClock};
pub use config::RelayConfig;
pub use error::{ConfigError, TransportError, WireError};
pub use interface::EventRecord;
pub use relay::{EventRelay, RelayState};
pub use retstack::{instrumentation_suppressed, open_call_depth, suppress_instrumentation};
pub use session::CaptureSession;
pub use thread::{current_thread_id, process_id};
