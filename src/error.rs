use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a transfer, browse or session operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The counterpart command could not be started.
    #[error("start remote command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Malformed header, unexpected control byte or premature end of a frame.
    /// Usually means the two peers run incompatible versions.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local filesystem or stream failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// An on-disk resume marker does not match what is on disk.
    #[error("resume state for {path} is invalid: {reason}")]
    ResumeStateInvalid { path: PathBuf, reason: String },

    /// The counterpart process failed.
    #[error("remote command failed: {0}")]
    Remote(String),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

impl TransferError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        TransferError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error came from a stream that closed underneath us.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransferError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io {
            context: "i/o".to_string(),
            source: err,
        }
    }
}

/// Attach context to a raw `io::Result`, mirroring `anyhow::Context`.
pub trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: C) -> Result<T>;
    fn with_io_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| TransferError::io(context, e))
    }

    fn with_io_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| TransferError::io(f(), e))
    }
}
