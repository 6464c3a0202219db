//! Bidirectional byte relay between the tunnel and the destination.
//!
//! One loop waits for either socket to become readable, with a bounded wait
//! that only exists so the loop can notice server shutdown. Data read from
//! one side is written in full to the other before the loop waits again, so
//! bytes are never dropped or reordered within a direction. EOF or an error
//! on either side tears down both directions together; there is no
//! half-close and no idle timeout.

use crate::shutdown::ShutdownFlag;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Per-direction read buffer size.
    pub buffer_size: usize,
    /// Longest wait for readiness before the shutdown flag is rechecked.
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Bytes moved by one relay, per direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub inbound_to_outbound: u64,
    pub outbound_to_inbound: u64,
}

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The tunnel side reached EOF.
    InboundClosed,
    /// The destination side reached EOF.
    OutboundClosed,
    /// A read or write failed on either side.
    Error(io::Error),
    /// The server stopped and the poll interval elapsed.
    Shutdown,
}

enum Event {
    Inbound(io::Result<usize>),
    Outbound(io::Result<usize>),
    Tick,
}

/// Relay bytes between `inbound` and `outbound` until either closes, fails,
/// or `shutdown` is observed. Both streams are shut down before returning.
pub async fn relay<A, B>(
    inbound: A,
    outbound: B,
    config: &RelayConfig,
    shutdown: &ShutdownFlag,
) -> (RelayEnd, RelayStats)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);
    let mut in_buf = vec![0u8; config.buffer_size];
    let mut out_buf = vec![0u8; config.buffer_size];
    let mut stats = RelayStats::default();

    let end = loop {
        let event = tokio::select! {
            result = in_read.read(&mut in_buf) => Event::Inbound(result),
            result = out_read.read(&mut out_buf) => Event::Outbound(result),
            _ = tokio::time::sleep(config.poll_interval) => Event::Tick,
        };

        match event {
            Event::Inbound(Ok(0)) => break RelayEnd::InboundClosed,
            Event::Inbound(Ok(n)) => {
                if let Err(e) = write_fully(&mut out_write, &in_buf[..n]).await {
                    break RelayEnd::Error(e);
                }
                stats.inbound_to_outbound += n as u64;
                trace!(bytes = n, "tunnel -> destination");
            }
            Event::Outbound(Ok(0)) => break RelayEnd::OutboundClosed,
            Event::Outbound(Ok(n)) => {
                if let Err(e) = write_fully(&mut in_write, &out_buf[..n]).await {
                    break RelayEnd::Error(e);
                }
                stats.outbound_to_inbound += n as u64;
                trace!(bytes = n, "destination -> tunnel");
            }
            Event::Inbound(Err(e)) | Event::Outbound(Err(e)) => break RelayEnd::Error(e),
            Event::Tick => {
                if shutdown.is_shutdown() {
                    break RelayEnd::Shutdown;
                }
            }
        }
    };

    let _ = in_write.shutdown().await;
    let _ = out_write.shutdown().await;
    (end, stats)
}

/// Write all of `data`, retrying short writes until done or failed.
async fn write_fully<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}
