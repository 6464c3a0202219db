//! `vtunnel connect`: bridge one tunnel with stdin/stdout.

use anyhow::{Context, Result};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use vtunnel_core::{dial, Endpoint};

pub async fn run(server: &Endpoint, port: u16) -> Result<()> {
    let tunnel = dial(server, port)
        .await
        .with_context(|| format!("opening tunnel to host port {port} via {server}"))?;

    let received = bridge(tunnel, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("tunnel transfer failed")?;
    debug!(port, received, "tunnel closed");
    Ok(())
}

/// Pump `input` into the tunnel and the tunnel into `output` until the
/// tunnel side closes. Returns the number of bytes written to `output`.
///
/// EOF on `input` does not end the bridge: the relay has no half-close, so
/// closing our write side would cut off the reply still in flight.
pub(crate) async fn bridge<T, I, O>(tunnel: T, mut input: I, mut output: O) -> io::Result<u64>
where
    T: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let upstream = async {
        if let Err(e) = tokio::io::copy(&mut input, &mut tunnel_write).await {
            debug!(error = %e, "upstream copy ended");
        }
        std::future::pending::<()>().await;
    };

    let received = tokio::select! {
        result = tokio::io::copy(&mut tunnel_read, &mut output) => result?,
        _ = upstream => 0,
    };
    output.flush().await?;
    Ok(received)
}
