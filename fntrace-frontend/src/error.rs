use std::time::Duration;

use fntrace::{TransportError, WireError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Producer closed the connection before all events were sent")]
    UnexpectedEof,

    #[error("Capture did not end within {0:?}")]
    Timeout(Duration),
}
