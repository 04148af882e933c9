//! NRI adapter errors

use thiserror::Error;

/// Protocol and configuration errors of the NRI adapter
#[derive(Debug, Error)]
pub enum NriError {
    #[error("unknown NRI event: {0}")]
    UnknownEvent(String),

    #[error("invalid plugin configuration: {0}")]
    InvalidConfig(#[from] config::ConfigError),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request missing {0}")]
    MissingField(&'static str),

    #[error("plugin is closed")]
    Closed,
}

/// Errors of the framed connection to the runtime
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("unexpected message type {0}")]
    UnexpectedType(u8),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
