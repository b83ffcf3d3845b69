//! In-process transport, for embedding the collector in the traced process and for tests.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::{Connection, Connector};
use crate::error::TransportError;
use crate::wire::{CaptureCommand, ProducerMessage};

/// Creates a connected connector/endpoint pair.
pub fn channel() -> (ChannelConnector, ChannelEndpoint) {
    let (links_tx, links_rx) = channel::unbounded();
    (
        ChannelConnector { links: links_tx },
        ChannelEndpoint { links: links_rx },
    )
}

/// Producer side. Every `connect` hands a fresh [`CollectorLink`] to the endpoint.
#[derive(Debug)]
pub struct ChannelConnector {
    links: Sender<CollectorLink>,
}

/// Collector side, accepting one link per producer connection.
#[derive(Debug)]
pub struct ChannelEndpoint {
    links: Receiver<CollectorLink>,
}

impl ChannelEndpoint {
    /// Waits up to `timeout` for the next producer connection.
    pub fn accept(&self, timeout: Duration) -> Option<CollectorLink> {
        self.links.recv_timeout(timeout).ok()
    }
}

/// Collector end of one connection. Dropping it disconnects the producer.
#[derive(Debug)]
pub struct CollectorLink {
    commands: Sender<CaptureCommand>,
    messages: Receiver<ProducerMessage>,
}

impl CollectorLink {
    pub fn send_command(&self, command: CaptureCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Disconnected)
    }

    pub fn start_capture(&self) -> Result<(), TransportError> {
        self.send_command(CaptureCommand::StartCapture)
    }

    pub fn stop_capture(&self) -> Result<(), TransportError> {
        self.send_command(CaptureCommand::StopCapture)
    }

    pub fn capture_finished(&self) -> Result<(), TransportError> {
        self.send_command(CaptureCommand::CaptureFinished)
    }

    /// Next message from the producer. `None` on timeout or once the producer is gone and
    /// everything it sent has been received.
    pub fn recv(&self, timeout: Duration) -> Option<ProducerMessage> {
        match self.messages.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Connector for ChannelConnector {
    fn connect(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let (commands_tx, commands_rx) = channel::unbounded();
        let (messages_tx, messages_rx) = channel::unbounded();
        self.links
            .send(CollectorLink {
                commands: commands_tx,
                messages: messages_rx,
            })
            .map_err(|_| TransportError::Refused)?;
        Ok(Box::new(ChannelConnection {
            commands: commands_rx,
            messages: messages_tx,
        }))
    }
}

struct ChannelConnection {
    commands: Receiver<CaptureCommand>,
    messages: Sender<ProducerMessage>,
}

impl Connection for ChannelConnection {
    fn poll_command(&mut self) -> Result<Option<CaptureCommand>, TransportError> {
        match self.commands.try_recv() {
            Ok(command) => Ok(Some(command)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn send(&mut self, messages: &[ProducerMessage]) -> Result<(), TransportError> {
        for message in messages {
            self.messages
                .send(*message)
                .map_err(|_| TransportError::Disconnected)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(500);

    #[test]
    fn commands_and_messages_flow_both_ways() {
        let (mut connector, endpoint) = channel();
        let mut connection = connector.connect().unwrap();
        let link = endpoint.accept(WAIT).expect("link handed over on connect");

        assert!(connection.poll_command().unwrap().is_none());
        link.start_capture().unwrap();
        link.stop_capture().unwrap();
        assert_eq!(
            connection.poll_command().unwrap(),
            Some(CaptureCommand::StartCapture)
        );
        assert_eq!(
            connection.poll_command().unwrap(),
            Some(CaptureCommand::StopCapture)
        );

        let done = ProducerMessage::AllEventsSent { dropped_events: 0 };
        connection.send(&[done]).unwrap();
        assert_eq!(link.recv(WAIT), Some(done));
    }

    #[test]
    fn dropping_either_side_disconnects() {
        let (mut connector, endpoint) = channel();
        let mut connection = connector.connect().unwrap();
        drop(endpoint.accept(WAIT).unwrap());
        assert!(matches!(
            connection.poll_command(),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            connection.send(&[ProducerMessage::AllEventsSent { dropped_events: 0 }]),
            Err(TransportError::Disconnected)
        ));

        drop(endpoint);
        assert!(matches!(connector.connect(), Err(TransportError::Refused)));
    }
}
