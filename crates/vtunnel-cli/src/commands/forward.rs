//! `vtunnel forward`: expose a host loopback port inside the guest.
//!
//! Every local connection gets its own transport connection and tunnel; the
//! server never multiplexes.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use vtunnel_core::{dial, Endpoint};

pub async fn run(server: &Endpoint, listen: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let local = listener.local_addr()?;

    info!(local = %local, port, server = %server, "forwarding");
    println!("forwarding {local} -> host port {port}");

    serve(listener, server.clone(), port).await;
    Ok(())
}

/// Pause after a failed accept so a persistent error (EMFILE) does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept local connections forever, tunnelling each to `port`.
pub(crate) async fn serve(listener: TcpListener, server: Endpoint, port: u16) {
    loop {
        let (mut local, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let server = server.clone();
        tokio::spawn(async move {
            let mut tunnel = match dial(&server, port).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!(peer = %peer, port, error = %e, "could not open tunnel");
                    return;
                }
            };
            debug!(peer = %peer, port, "tunnel open");

            match tokio::io::copy_bidirectional(&mut local, &mut tunnel).await {
                Ok((sent, received)) => debug!(peer = %peer, sent, received, "forward closed"),
                Err(e) => debug!(peer = %peer, error = %e, "forward ended with error"),
            }
        });
    }
}
