//! Unix domain socket transport. The collector listens on a well-known path.

use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use super::{Connection, Connector};
use crate::error::TransportError;
use crate::wire::{CaptureCommand, ProducerMessage, MAX_MESSAGE_SIZE};

#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: PathBuf,
}

impl UnixSocketConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        UnixSocketConnector {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for UnixSocketConnector {
    fn connect(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let stream = UnixStream::connect(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TransportError::Refused,
            _ => TransportError::Io(e),
        })?;
        Ok(Box::new(UnixSocketConnection {
            stream,
            buf: Vec::with_capacity(64 * MAX_MESSAGE_SIZE),
        }))
    }
}

struct UnixSocketConnection {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl Connection for UnixSocketConnection {
    fn poll_command(&mut self) -> Result<Option<CaptureCommand>, TransportError> {
        let mut byte = [0u8; 1];
        // Commands are single bytes, so a non-blocking read never splits one.
        self.stream.set_nonblocking(true)?;
        let read = self.stream.read(&mut byte);
        self.stream.set_nonblocking(false)?;

        match read {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(_) => Ok(Some(CaptureCommand::from_byte(byte[0])?)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(disconnect_or_io(e)),
        }
    }

    fn send(&mut self, messages: &[ProducerMessage]) -> Result<(), TransportError> {
        self.buf.clear();
        for message in messages {
            message.encode(&mut self.buf)?;
        }
        write_all(&mut self.stream, &self.buf).map_err(disconnect_or_io)
    }
}

fn disconnect_or_io(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
        _ => TransportError::Io(e),
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        use std::os::unix::io::AsRawFd;

        /// `write_all` that reports a closed peer as `EPIPE` instead of raising `SIGPIPE`. The
        /// traced process has not necessarily ignored `SIGPIPE`.
        fn write_all(stream: &mut UnixStream, mut buf: &[u8]) -> io::Result<()> {
            while !buf.is_empty() {
                let sent = unsafe {
                    libc::send(
                        stream.as_raw_fd(),
                        buf.as_ptr().cast(),
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                match sent {
                    -1 => {
                        let err = io::Error::last_os_error();
                        if err.kind() != io::ErrorKind::Interrupted {
                            return Err(err);
                        }
                    }
                    0 => return Err(io::ErrorKind::WriteZero.into()),
                    n => buf = &buf[n as usize..],
                }
            }
            Ok(())
        }
    } else {
        use std::io::Write;

        fn write_all(stream: &mut UnixStream, buf: &[u8]) -> io::Result<()> {
            stream.write_all(buf)
        }
    }
}
