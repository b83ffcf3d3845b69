use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use super::{CaptureStartHook, RelayState, Shared};
use crate::config::RelayConfig;
use crate::error::TransportError;
use crate::retstack::suppress_instrumentation;
use crate::transport::{Connection, Connector};
use crate::wire::{CaptureCommand, ProducerMessage};

/// Where the collector's current capture stands, as far as this producer is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureStatus {
    Finished,
    Started,
    Stopped,
}

/// Drains the buffer and talks to the collector. Owns the connection exclusively.
pub(super) struct Worker {
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn Connection>>,
    config: RelayConfig,
    status: CaptureStatus,
    dropped_at_capture_start: u64,
    last_attempt: Instant,
    batch: Vec<ProducerMessage>,
    on_capture_start: CaptureStartHook,
}

impl Worker {
    pub fn new(
        shared: Arc<Shared>,
        connector: Box<dyn Connector>,
        connection: Option<Box<dyn Connection>>,
        config: RelayConfig,
        on_capture_start: CaptureStartHook,
    ) -> Self {
        let batch = Vec::with_capacity(config.batch_size.max(1));
        Worker {
            shared,
            connector,
            connection,
            config,
            status: CaptureStatus::Finished,
            dropped_at_capture_start: 0,
            last_attempt: Instant::now(),
            batch,
            on_capture_start,
        }
    }

    pub fn run(mut self) {
        // Whatever the transport calls on this thread must not feed back into the buffer.
        let _suppressed = suppress_instrumentation();

        loop {
            let shutting_down = self.shared.shutdown.load(Ordering::Acquire);

            if self.connection.is_some() {
                self.poll_commands();
            } else if !shutting_down {
                self.reconnect_if_due();
            }

            let forwarded = self.forward();

            if shutting_down && self.shared.buffer.is_empty() {
                break;
            }
            if forwarded == 0 {
                thread::sleep(self.config.poll_interval);
            }
        }

        self.close();
    }

    fn poll_commands(&mut self) {
        while let Some(connection) = self.connection.as_mut() {
            match connection.poll_command() {
                Ok(Some(command)) => {
                    if let Err(e) = self.on_command(command) {
                        self.on_disconnect(e);
                    }
                }
                Ok(None) => return,
                Err(e) => self.on_disconnect(e),
            }
        }
    }

    fn on_command(&mut self, command: CaptureCommand) -> Result<(), TransportError> {
        debug!("Received {:?} while {:?}", command, self.status);
        match (command, self.status) {
            (CaptureCommand::StartCapture, CaptureStatus::Started)
            | (CaptureCommand::StopCapture, CaptureStatus::Stopped)
            | (CaptureCommand::CaptureFinished, CaptureStatus::Finished) => {}

            (CaptureCommand::StartCapture, CaptureStatus::Finished) => self.begin_capture(),
            (CaptureCommand::StartCapture, CaptureStatus::Stopped) => {
                self.finish_capture();
                self.begin_capture();
            }

            (CaptureCommand::StopCapture, CaptureStatus::Started) => self.end_capture()?,
            (CaptureCommand::StopCapture, CaptureStatus::Finished) => {
                self.begin_capture();
                self.end_capture()?;
            }

            (CaptureCommand::CaptureFinished, CaptureStatus::Started) => {
                self.end_capture()?;
                self.finish_capture();
            }
            (CaptureCommand::CaptureFinished, CaptureStatus::Stopped) => self.finish_capture(),
        }
        Ok(())
    }

    fn begin_capture(&mut self) {
        // Left over from producers that saw the previous capture still running.
        let stale = self.discard_buffered();
        if stale > 0 {
            debug!("Discarded {} records from before the capture", stale);
        }

        self.dropped_at_capture_start = self.shared.buffer.dropped();
        self.status = CaptureStatus::Started;
        (self.on_capture_start)();
        self.shared.capturing.store(true, Ordering::Release);
        info!("Capture started");
    }

    fn discard_buffered(&mut self) -> usize {
        let mut discarded = 0;
        while discarded < self.shared.buffer.capacity() && self.shared.buffer.pop().is_some() {
            discarded += 1;
        }
        self.shared
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        discarded
    }

    /// Stops accepting records, sends what is buffered and tells the collector we are done.
    fn end_capture(&mut self) -> Result<(), TransportError> {
        self.shared.capturing.store(false, Ordering::Relaxed);
        self.status = CaptureStatus::Stopped;

        let mut budget = self.shared.buffer.capacity();
        while budget > 0 && self.fill_batch(budget) > 0 {
            budget -= self.batch.len();
            self.send_batch()?;
        }

        let dropped_events = self.shared.buffer.dropped() - self.dropped_at_capture_start;
        if dropped_events > 0 {
            warn!(
                "Dropped {} events during capture, buffer capacity is {}",
                dropped_events,
                self.shared.buffer.capacity()
            );
        }
        self.batch.clear();
        self.batch
            .push(ProducerMessage::AllEventsSent { dropped_events });
        self.send_batch()?;
        info!("Capture stopped, all events sent");
        Ok(())
    }

    fn finish_capture(&mut self) {
        self.status = CaptureStatus::Finished;
        debug!("Capture finished");
    }

    /// Moves buffered records to the collector, or discards them outside of a capture. Returns
    /// how many records were taken out of the buffer.
    fn forward(&mut self) -> usize {
        // Bounded, so fast producers cannot keep us from polling commands.
        let mut budget = self.shared.buffer.capacity();
        let mut forwarded = 0;

        while budget > 0 {
            let n = self.fill_batch(budget);
            if n == 0 {
                break;
            }
            budget -= n;
            forwarded += n;

            if self.status == CaptureStatus::Started {
                if let Err(e) = self.send_batch() {
                    self.on_disconnect(e);
                }
            } else {
                self.shared
                    .discarded
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        forwarded
    }

    fn fill_batch(&mut self, budget: usize) -> usize {
        self.batch.clear();
        let limit = self.config.batch_size.max(1).min(budget);
        while self.batch.len() < limit {
            match self.shared.buffer.pop() {
                Some(record) => self
                    .batch
                    .push(ProducerMessage::CaptureEvent(record.into())),
                None => break,
            }
        }
        self.batch.len()
    }

    fn send_batch(&mut self) -> Result<(), TransportError> {
        match self.connection.as_mut() {
            Some(connection) => connection.send(&self.batch),
            None => Err(TransportError::Disconnected),
        }
    }

    fn on_disconnect(&mut self, e: TransportError) {
        warn!("Lost connection to collector: {}", e);
        self.connection = None;
        self.shared.capturing.store(false, Ordering::Relaxed);
        if self.status != CaptureStatus::Finished {
            info!("Capture aborted by disconnect");
        }
        self.status = CaptureStatus::Finished;
        self.shared.set_state(RelayState::Disconnected);
        self.last_attempt = Instant::now();
    }

    fn reconnect_if_due(&mut self) {
        if self.last_attempt.elapsed() < self.config.reconnect_delay {
            return;
        }

        self.shared.set_state(RelayState::Connecting);
        self.last_attempt = Instant::now();
        match self.connector.connect() {
            Ok(connection) => {
                info!("Reconnected to collector");
                self.connection = Some(connection);
                self.shared.set_state(RelayState::Connected);
            }
            Err(e) => {
                debug!("Reconnecting to collector failed: {}", e);
                self.shared.set_state(RelayState::Disconnected);
            }
        }
    }

    fn close(mut self) {
        if self.status == CaptureStatus::Started {
            if let Err(e) = self.end_capture() {
                warn!("Could not finish capture on shutdown: {}", e);
            }
        }
        self.shared.capturing.store(false, Ordering::Relaxed);
        self.connection = None;
        self.shared.set_state(RelayState::Closed);
        debug!(
            "Relay closed, {} events dropped and {} discarded in total",
            self.shared.buffer.dropped(),
            self.shared.discarded.load(Ordering::Relaxed)
        );
    }
}
