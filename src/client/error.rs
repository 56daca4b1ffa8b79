use thiserror::Error;

use crate::connection;
use crate::messenger::RequestError;
use crate::protocol::error::Error as ApiError;
use crate::protocol::messages::{ReadVersionedError, WriteVersionedError};
use crate::protocol::traits::{ReadError, WriteError};

/// The error kinds surfaced by every public operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed frames, unknown schemas, CRC mismatches. The offending
    /// connection is closed because its framing is suspect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket errors, unexpected EOF, write failures. The connection is
    /// replaced; retriable work is retried.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An error code returned by a broker.
    #[error("Broker error: {0}")]
    Broker(ApiError),

    /// Invalid user input, raised synchronously at construction or connect.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A compression codec seen on the wire without its decoder compiled in.
    #[error("Unsupported compression codec: {0}")]
    UnsupportedCompression(String),

    /// Group coordination failed beyond the retry budget.
    #[error("Group error: {0}")]
    Group(String),

    /// A structurally valid response that does not answer the question asked.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The operation's overall deadline elapsed.
    #[error("Operation timed out")]
    TimedOut,

    /// Value (de)serialization failed.
    #[error("Cannot (de)serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<RequestError> for Error {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Poisoned(reason) => Self::Connection(reason.to_string()),
            RequestError::IO(e) => Self::Connection(e.to_string()),
            RequestError::WriteMessageError(e) => Self::Connection(e.to_string()),
            RequestError::WriteError(WriteVersionedError::WriteError(
                WriteError::UnsupportedCompression { codec },
            )) => Self::UnsupportedCompression(codec.to_owned()),
            RequestError::WriteError(e) => Self::Protocol(e.to_string()),
            RequestError::ReadError(ReadVersionedError::ReadError(
                ReadError::UnsupportedCompression { codec },
            )) => Self::UnsupportedCompression(codec.to_owned()),
            RequestError::ReadError(e) => Self::Protocol(e.to_string()),
        }
    }
}

impl From<connection::Error> for Error {
    fn from(e: connection::Error) -> Self {
        match e {
            connection::Error::Metadata(e) => e.into(),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::UnsupportedCompression { codec } => {
                Self::UnsupportedCompression(codec.to_owned())
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::UnsupportedCompression { codec } => {
                Self::UnsupportedCompression(codec.to_owned())
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}
