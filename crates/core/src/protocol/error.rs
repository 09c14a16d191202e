//! Error types for the request-handling core.
//!
//! [`ParseError`] covers incremental decoding of the framed request header
//! and of the application's response header. [`ClientError`] is the top-level
//! error a client connection is disconnected with; its `Display` output is
//! the message that ends up in the disconnect log line.

use std::io;
use thiserror::Error;

/// Errors produced while decoding the framed request header or while
/// buffering the application's response header.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The framed header block exceeds the configured maximum.
    #[error("request header block exceeds the limit of {max} bytes")]
    LimitReached { max: usize },

    /// The framed header block is not a valid netstring of key/value pairs.
    #[error("malformed request header block: {reason}")]
    Malformed { reason: String },

    /// The application's response header grew past its cap without a
    /// terminating empty line.
    #[error("response header too large, current: {current} exceeds the limit {max}")]
    ResponseHeadTooLarge { current: usize, max: usize },

    /// I/O error during decoding.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn limit_reached(max: usize) -> Self {
        Self::LimitReached { max }
    }

    pub fn malformed<S: ToString>(reason: S) -> Self {
        Self::Malformed { reason: reason.to_string() }
    }

    pub fn response_head_too_large(current: usize, max: usize) -> Self {
        Self::ResponseHeadTooLarge { current, max }
    }
}

/// The reason a client connection was torn down.
///
/// Variants mirror the disconnect messages the accept loop logs: protocol
/// violations by the client, protocol violations by the application, session
/// checkout failures and socket-level I/O errors on either side.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("wrong connect password")]
    WrongConnectPassword,

    #[error("no connect password received within timeout")]
    ConnectPasswordTimeout,

    #[error("{source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("application sent malformed response: it didn't send a Status header.")]
    MissingStatusHeader,

    #[error("could not initiate a session")]
    InitiateSession,

    #[error("client socket read error: {source}")]
    ClientRead { source: io::Error },

    #[error("client socket write error: {source}")]
    ClientWrite { source: io::Error },

    #[error("app socket read error: {source}")]
    AppRead { source: io::Error },

    #[error("app socket write error: {source}")]
    AppWrite { source: io::Error },

    #[error("client body buffer error: {source}")]
    BodyBuffer { source: io::Error },

    #[error("client output pipe error: {source}")]
    OutputPipe { source: io::Error },
}

impl ClientError {
    pub fn client_read(source: io::Error) -> Self {
        Self::ClientRead { source }
    }

    pub fn client_write(source: io::Error) -> Self {
        Self::ClientWrite { source }
    }

    pub fn app_read(source: io::Error) -> Self {
        Self::AppRead { source }
    }

    pub fn app_write(source: io::Error) -> Self {
        Self::AppWrite { source }
    }

    pub fn body_buffer(source: io::Error) -> Self {
        Self::BodyBuffer { source }
    }

    pub fn output_pipe(source: io::Error) -> Self {
        Self::OutputPipe { source }
    }
}
