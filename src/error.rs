//! Error types for zero-singlestore.

use thiserror::Error;

use crate::batch::BatchError;
use crate::constant::error_code;

/// Result type for zero-singlestore operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Decoded ERR packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Server error code
    pub code: u16,
    /// SQLSTATE (5 characters), `HY000` when the server did not send one
    pub sql_state: String,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) {} [{}]", self.code, self.message, self.sql_state)
    }
}

/// Error type for zero-singlestore.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response; the connection remains usable
    #[error("Server error: {0}")]
    Server(ServerError),

    /// Malformed or out-of-sequence packet
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect, handshake or initialization failure
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// The connection was closed before or during the call
    #[error("{}", closed_message(.timed_out))]
    ConnectionClosed { timed_out: bool },

    /// Command payload exceeds the server's max_allowed_packet
    #[error("Packet too big for current server max_allowed_packet value ({size} > {max})")]
    PacketTooLarge {
        size: usize,
        max: usize,
        /// Some bytes of the command were already flushed; the stream is unusable
        must_reconnect: bool,
    },

    /// A statement exceeded its query timeout and the connection was closed
    #[error("Socket error: query timed out")]
    Timeout,

    /// Batch or pipeline failure carrying partial results
    #[error("Batch error: {0}")]
    Batch(Box<BatchError>),

    /// Authentication failed on the client side
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Invalid usage (e.g., upgrading TLS twice)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

fn closed_message(timed_out: &bool) -> &'static str {
    if *timed_out {
        "Connection is closed due to query timed out"
    } else {
        "Connection is closed"
    }
}

impl Error {
    pub(crate) fn connection(message: impl Into<String>, source: Option<Error>) -> Self {
        Error::Connection {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Protocol(_)
            | Error::Connection { .. }
            | Error::ConnectionClosed { .. }
            | Error::Timeout => true,
            #[cfg(feature = "tls")]
            Error::Tls(_) => true,
            Error::PacketTooLarge { must_reconnect, .. } => *must_reconnect,
            Error::Batch(batch) => batch.cause().is_connection_broken(),
            Error::Server(_) | Error::Auth(_) | Error::InvalidUsage(_) | Error::Unsupported(_) => {
                false
            }
        }
    }

    /// Stable SQL-state-like code for every failure.
    pub fn sqlstate(&self) -> &str {
        match self {
            Error::Server(e) => &e.sql_state,
            Error::Io(_)
            | Error::Protocol(_)
            | Error::Connection { .. }
            | Error::ConnectionClosed { .. } => "08000",
            #[cfg(feature = "tls")]
            Error::Tls(_) => "08000",
            Error::PacketTooLarge { must_reconnect, .. } => {
                if *must_reconnect {
                    "08000"
                } else {
                    "HZ000"
                }
            }
            Error::Timeout => "70100",
            Error::Batch(batch) => batch.cause().sqlstate(),
            Error::Auth(_) => "28000",
            Error::InvalidUsage(_) => "HY000",
            Error::Unsupported(_) => "0A000",
        }
    }

    /// Vendor error code, when one applies.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            Error::ConnectionClosed { .. } => Some(error_code::CONNECTION_CLOSED),
            Error::Timeout => Some(error_code::QUERY_INTERRUPTED),
            Error::Batch(batch) => batch.cause().error_code(),
            Error::Auth(_) => Some(error_code::ACCESS_DENIED),
            _ => None,
        }
    }

    /// The server error, if this is one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            Error::Connection {
                source: Some(source),
                ..
            } => source.server_error(),
            _ => None,
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}
