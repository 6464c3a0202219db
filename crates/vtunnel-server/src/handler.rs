//! Per-connection session handling.
//!
//! Every accepted connection runs through the same short state machine:
//!
//! ```text
//! AWAITING_COMMAND ──valid CONNECT + destination up──▶ RELAYING ──EOF/error──▶ CLOSED
//!        │
//!        └──bad command / denied port / unreachable──▶ ERROR line ──▶ CLOSED
//! ```
//!
//! The handshake response always goes out before any relayed byte, and no
//! outbound connection is attempted until the command line has been fully
//! read and validated. Failures stay inside the session.

use crate::config::ServerConfig;
use crate::policy::TunnelPolicy;
use crate::relay::{relay, RelayConfig, RelayEnd, RelayStats};
use crate::resolver::LoopbackResolver;
use crate::shutdown::ShutdownFlag;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use vtunnel_core::{read_line, ConnectRequest, ProtocolError, Response, TunnelError};

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The relay ran and then terminated.
    Relayed { port: u16, end: RelayEnd, stats: RelayStats },
    /// An `ERROR` line was sent before any outbound action.
    Rejected(String),
    /// The destination was unreachable; an `ERROR` line was sent.
    Unreachable { port: u16 },
    /// The peer went away (or stayed silent too long) before a response
    /// could be delivered.
    Abandoned,
}

/// Shared, immutable per-session logic. One instance serves every session.
#[derive(Debug)]
pub struct ConnectionHandler {
    resolver: LoopbackResolver,
    relay: RelayConfig,
    max_line: usize,
    command_timeout: Option<Duration>,
    policy: Arc<TunnelPolicy>,
    shutdown: ShutdownFlag,
}

impl ConnectionHandler {
    pub fn new(config: &ServerConfig, policy: Arc<TunnelPolicy>, shutdown: ShutdownFlag) -> Self {
        Self {
            resolver: LoopbackResolver::new(config.connect_timeout),
            relay: RelayConfig {
                buffer_size: config.buffer_size,
                poll_interval: config.poll_interval,
            },
            max_line: config.max_line,
            command_timeout: config.command_timeout,
            policy,
            shutdown,
        }
    }

    /// Run one session to completion. `session` only tags log lines.
    pub async fn handle<S>(&self, session: u64, mut inbound: S) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _guard = match self.policy.try_acquire() {
            Ok(guard) => guard,
            Err(reason) => {
                warn!(session, reason = %reason, "session refused");
                send_error(&mut inbound, &reason).await;
                return SessionOutcome::Rejected(reason);
            }
        };

        let line = match self.read_command(&mut inbound).await {
            Ok(line) => line,
            Err(TunnelError::Protocol(ProtocolError::LineTooLong)) => {
                let reason = ProtocolError::LineTooLong.to_string();
                debug!(session, "command line too long");
                send_error(&mut inbound, &reason).await;
                return SessionOutcome::Rejected(reason);
            }
            Err(e) => {
                debug!(session, error = %e, "no command received");
                return SessionOutcome::Abandoned;
            }
        };

        let request = match ConnectRequest::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!(session, line = %line.escape_debug(), "invalid command");
                let reason = e.to_string();
                send_error(&mut inbound, &reason).await;
                return SessionOutcome::Rejected(reason);
            }
        };
        let port = request.port;

        if let Err(reason) = self.policy.check_port(port) {
            info!(session, port, "destination port denied");
            send_error(&mut inbound, &reason).await;
            return SessionOutcome::Rejected(reason);
        }

        let outbound = match self.resolver.connect(port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session, port, error = %e, "destination unreachable");
                let response = Response::cannot_connect(port);
                send_response(&mut inbound, &response).await;
                return SessionOutcome::Unreachable { port };
            }
        };

        if let Err(e) = write_response(&mut inbound, &Response::Ok).await {
            debug!(session, port, error = %e, "peer gone before OK");
            return SessionOutcome::Abandoned;
        }
        info!(session, port, "tunnel established");

        let (end, stats) = relay(inbound, outbound, &self.relay, &self.shutdown).await;
        match &end {
            RelayEnd::Error(e) => info!(
                session,
                port,
                error = %e,
                sent = stats.inbound_to_outbound,
                received = stats.outbound_to_inbound,
                "tunnel closed with error"
            ),
            _ => info!(
                session,
                port,
                reason = ?end,
                sent = stats.inbound_to_outbound,
                received = stats.outbound_to_inbound,
                "tunnel closed"
            ),
        }

        SessionOutcome::Relayed { port, end, stats }
    }

    async fn read_command<S>(&self, inbound: &mut S) -> Result<String, TunnelError>
    where
        S: AsyncRead + Unpin,
    {
        match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, read_line(inbound, self.max_line))
                .await
                .map_err(|_| {
                    TunnelError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out waiting for command",
                    ))
                })?,
            None => read_line(inbound, self.max_line).await,
        }
    }
}

async fn write_response<S>(stream: &mut S, response: &Response) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response.encode().as_bytes()).await?;
    stream.flush().await
}

/// Send a final response and close the write side. Errors are ignored: the
/// session is ending either way.
async fn send_response<S>(stream: &mut S, response: &Response)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_response(stream, response).await {
        debug!(error = %e, "could not deliver response");
    }
    let _ = stream.shutdown().await;
}

async fn send_error<S>(stream: &mut S, message: &str)
where
    S: AsyncWrite + Unpin,
{
    send_response(stream, &Response::Error(message.to_string())).await;
}
