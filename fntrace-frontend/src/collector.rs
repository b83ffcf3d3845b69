use std::fs;
use std::io::{self, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fntrace::wire::{CaptureCommand, ProducerMessage};
use fntrace::WireError;
use log::{debug, info, warn};

use crate::error::FrontendError;
use crate::trace::CapturedTrace;

/// Listens for producers on a Unix socket.
#[derive(Debug)]
pub struct Collector {
    listener: UnixListener,
    path: PathBuf,
}

impl Collector {
    /// Listens on `path`, replacing a socket left behind by an earlier collector.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, FrontendError> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        info!("Listening for producers on {}", path.display());
        Ok(Collector { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until a producer connects.
    pub fn accept(&self) -> Result<ProducerSession, FrontendError> {
        let (stream, _) = self.listener.accept()?;
        info!("Producer connected");
        ProducerSession::new(stream)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove socket {}: {}", self.path.display(), e);
        }
    }
}

/// One connected producer.
#[derive(Debug)]
pub struct ProducerSession {
    commands: UnixStream,
    messages: BufReader<UnixStream>,
}

impl ProducerSession {
    pub fn new(stream: UnixStream) -> Result<Self, FrontendError> {
        let messages = BufReader::new(stream.try_clone()?);
        Ok(ProducerSession {
            commands: stream,
            messages,
        })
    }

    fn send_command(&mut self, command: CaptureCommand) -> Result<(), FrontendError> {
        debug!("Sending {:?}", command);
        self.commands.write_all(&[command.to_byte()])?;
        Ok(())
    }

    pub fn start_capture(&mut self) -> Result<(), FrontendError> {
        self.send_command(CaptureCommand::StartCapture)
    }

    pub fn stop_capture(&mut self) -> Result<(), FrontendError> {
        self.send_command(CaptureCommand::StopCapture)
    }

    pub fn capture_finished(&mut self) -> Result<(), FrontendError> {
        self.send_command(CaptureCommand::CaptureFinished)
    }

    /// Receives events until the producer reports the end of the capture.
    ///
    /// After a timeout the session may be positioned in the middle of a message and should not be
    /// read from again.
    pub fn collect_until_all_events_sent(
        &mut self,
        timeout: Duration,
    ) -> Result<CapturedTrace, FrontendError> {
        let deadline = Instant::now() + timeout;
        let mut trace = CapturedTrace::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FrontendError::Timeout(timeout));
            }
            self.messages.get_ref().set_read_timeout(Some(remaining))?;

            match ProducerMessage::decode(&mut self.messages) {
                Ok(Some(ProducerMessage::CaptureEvent(event))) => trace.events.push(event),
                Ok(Some(ProducerMessage::AllEventsSent { dropped_events })) => {
                    trace.dropped_events = dropped_events;
                    break;
                }
                Ok(None) => return Err(FrontendError::UnexpectedEof),
                Err(WireError::Io(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(FrontendError::Timeout(timeout))
                }
                Err(WireError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(FrontendError::UnexpectedEof)
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.messages.get_ref().set_read_timeout(None)?;
        info!(
            "Received {} events from {} threads",
            trace.events.len(),
            trace.thread_ids().len()
        );
        if trace.dropped_events > 0 {
            warn!(
                "Producer dropped {} events, the trace is incomplete",
                trace.dropped_events
            );
        }
        Ok(trace)
    }
}
