//! How the relay reaches the collector.
//!
//! The relay worker is the only user of these traits; nothing here is touched by the payloads.

use crate::error::TransportError;
use crate::wire::{CaptureCommand, ProducerMessage};

pub mod channel;
#[cfg(unix)]
pub mod unix;

/// Establishes connections to a collector. Called again after every disconnect.
pub trait Connector: Send + 'static {
    fn connect(&mut self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live connection to a collector.
pub trait Connection: Send {
    /// Returns the next pending command without waiting for one.
    fn poll_command(&mut self) -> Result<Option<CaptureCommand>, TransportError>;

    /// Sends `messages` in order.
    fn send(&mut self, messages: &[ProducerMessage]) -> Result<(), TransportError>;
}
