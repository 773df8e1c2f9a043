use thiserror::Error;

use crate::link::Link;

/// Errors surfaced by the graphsync engine.
///
/// `NotFound` is a per-branch condition during traversal and only becomes a
/// request error when the root itself is missing. Everything else terminates
/// the request it occurs in.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphsyncError {
    #[error("block not found: {0}")]
    NotFound(Link),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request rejected: {0}")]
    ValidationRejected(String),

    #[error("remote peer failed the request: {0}")]
    RequestFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<bincode::Error> for GraphsyncError {
    fn from(err: bincode::Error) -> Self {
        GraphsyncError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for GraphsyncError {
    fn from(err: std::io::Error) -> Self {
        GraphsyncError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for GraphsyncError {
    fn from(err: config::ConfigError) -> Self {
        GraphsyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphsyncError>;
