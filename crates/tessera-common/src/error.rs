//! Errors shared by the Tessera services.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures at the edges of a service: startup policy and frame decoding.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame that is not valid JSON or has the wrong shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A frame that could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn invalid_frame(msg: impl std::fmt::Display) -> Self {
        Self::InvalidFrame(msg.to_string())
    }

    pub fn encoding(msg: impl std::fmt::Display) -> Self {
        Self::Encoding(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
