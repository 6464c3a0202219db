use std::io;
use thiserror::Error;

/// Failures of the one-line control protocol.
///
/// The `Display` text of the first two variants is exactly what the server
/// sends after `ERROR ` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid command. Use: CONNECT <port>")]
    InvalidCommand,

    #[error("Command too long")]
    LineTooLong,

    #[error("connection closed before a complete line was received")]
    UnexpectedEof,

    #[error("unexpected response from server")]
    UnexpectedResponse,
}

/// Errors produced by the tunnel server and client.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("cannot connect to localhost:{port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("tunnel rejected: {0}")]
    Rejected(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
