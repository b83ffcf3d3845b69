//! Collector side of fntrace.
//! Accepts a producer connection, drives its captures and saves what it receives to disk in a
//! uftrace compatible format.

#[cfg(unix)]
mod collector;
mod error;
mod frontend;
mod trace;

#[cfg(unix)]
pub use collector::{Collector, ProducerSession};
pub use error::FrontendError;
pub use frontend::{dump_full_uftrace, dump_trace};
pub use trace::CapturedTrace;
