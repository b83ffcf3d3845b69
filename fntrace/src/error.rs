use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Unknown producer message tag {0}")]
    UnknownTag(u8),

    #[error("Unknown capture command {0}")]
    UnknownCommand(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Collector disconnected")]
    Disconnected,

    #[error("Collector is not accepting connections")]
    Refused,

    #[error(transparent)]
    Codec(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Event buffer capacity must be greater than zero")]
    ZeroCapacity,
}
