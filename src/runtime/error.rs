//! Error types for the Agora runtime
//!
//! Domain errors use thiserror. Handler code returns `anyhow::Result`, and a
//! failing handler is carried out of the event loop as [`RuntimeError::Handler`].

use std::io;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The address book has no entry for the requested interface
    #[error("No address registered for '{0}'")]
    UnknownAddress(String),

    /// An address book entry could not be used to bind or connect
    #[error("Invalid address for '{key}': {detail}")]
    InvalidAddress {
        /// Address book key (`"{name}-{kind}"`)
        key: String,
        /// Description of the problem
        detail: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framing errors on a socket owned by this node
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// A scheduled callable (demand, alteration, pulse, activity) failed
    #[error("Handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<anyhow::Error> for RuntimeError {
    /// Runtime errors that travelled through a callable come back unchanged,
    /// anything else becomes [`RuntimeError::Handler`].
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(err) => err,
            Err(err) => RuntimeError::Handler(err),
        }
    }
}

/// Multipart framing errors
#[derive(Debug, Error)]
pub enum WireError {
    /// A single part exceeds the frame size limit
    #[error("Frame part of {0} bytes exceeds the size limit")]
    PartTooLarge(usize),

    /// A message carries more parts than the header can describe
    #[error("Message with {0} parts exceeds the part limit")]
    TooManyParts(usize),

    /// The peer sent something that is not a valid message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for wire operations
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
