//! The tunnel control protocol.
//!
//! A session opens with exactly one line from the client and one line from
//! the server, after which the connection is an unframed byte pipe:
//!
//! ```text
//! Client → Server:  CONNECT <port>\r\n
//! Server → Client:  OK\r\n                 (then raw bidirectional bytes)
//!               or  ERROR <message>\r\n     (then the connection closes)
//! ```
//!
//! CRLF is always sent; a bare LF is accepted on input.

use crate::error::{ProtocolError, TunnelResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest control line accepted, terminator included.
pub const MAX_LINE: usize = 256;

const CONNECT_VERB: &str = "CONNECT";

/// A parsed `CONNECT <port>` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub port: u16,
}

impl ConnectRequest {
    /// Build a request for `port`, rejecting port 0.
    pub fn new(port: u16) -> Result<Self, ProtocolError> {
        if port == 0 {
            return Err(ProtocolError::InvalidCommand);
        }
        Ok(Self { port })
    }

    /// Parse a control line (terminator already removed).
    ///
    /// The line must hold exactly two whitespace-separated tokens: the verb
    /// `CONNECT` (any case) and a decimal port in `1..=65535`.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();
        let (Some(verb), Some(port), None) = (tokens.next(), tokens.next(), tokens.next()) else {
            return Err(ProtocolError::InvalidCommand);
        };

        if !verb.eq_ignore_ascii_case(CONNECT_VERB) {
            return Err(ProtocolError::InvalidCommand);
        }

        // u16::from_str tolerates a leading '+', the wire format does not.
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidCommand);
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidCommand)?;
        Self::new(port)
    }

    /// Encode as a CRLF-terminated wire line.
    pub fn encode(&self) -> String {
        format!("{CONNECT_VERB} {}\r\n", self.port)
    }
}

/// The server's single response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error(String),
}

impl Response {
    /// Response for a grammar failure or an oversized line.
    pub fn protocol_error(err: ProtocolError) -> Self {
        Response::Error(err.to_string())
    }

    /// Response sent when neither loopback address accepted the connection.
    pub fn cannot_connect(port: u16) -> Self {
        Response::Error(format!("Cannot connect to localhost:{port}"))
    }

    /// Encode as a CRLF-terminated wire line.
    pub fn encode(&self) -> String {
        match self {
            Response::Ok => "OK\r\n".to_string(),
            Response::Error(message) => format!("ERROR {message}\r\n"),
        }
    }

    /// Parse a response line (terminator already removed).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line == "OK" {
            return Ok(Response::Ok);
        }
        match line.strip_prefix("ERROR") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                Ok(Response::Error(rest.trim().to_string()))
            }
            _ => Err(ProtocolError::UnexpectedResponse),
        }
    }
}

/// Read one control line, one byte at a time.
///
/// Reading stops at `\n`; a preceding `\r` is stripped. Nothing past the
/// terminator is consumed, so whatever follows stays in the stream for the
/// relay. Fails with [`ProtocolError::LineTooLong`] once `max_len` bytes
/// arrive without a terminator and with [`ProtocolError::UnexpectedEof`] if
/// the peer closes first. Invalid UTF-8 is replaced rather than rejected;
/// such a line can never parse as a command anyway.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> TunnelResult<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::with_capacity(32);
    let mut byte = [0u8; 1];

    loop {
        if line.len() >= max_len {
            return Err(ProtocolError::LineTooLong.into());
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
