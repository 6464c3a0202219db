//! Loopback destination connect.
//!
//! "localhost" is resolved by trying `127.0.0.1` first and `::1` second,
//! one attempt each. Most local services bind IPv4 or dual-stack; the IPv6
//! attempt catches the IPv6-only ones.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use vtunnel_core::{TunnelError, TunnelResult};

/// Addresses tried, in order.
pub const LOOPBACK_CANDIDATES: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
];

/// Connects to host loopback services.
#[derive(Debug, Clone)]
pub struct LoopbackResolver {
    connect_timeout: Duration,
}

impl LoopbackResolver {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to `port` on the loopback interface.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Connect`] carrying the error of the last attempt when
    /// neither address accepted the connection.
    pub async fn connect(&self, port: u16) -> TunnelResult<TcpStream> {
        let mut last_error = None;

        for ip in LOOPBACK_CANDIDATES {
            let addr = SocketAddr::new(ip, port);
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(addr = %addr, error = %e, "could not set TCP_NODELAY");
                    }
                    debug!(addr = %addr, "destination connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(addr = %addr, error = %e, "destination connect failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(addr = %addr, "destination connect timed out");
                    last_error = Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    ));
                }
            }
        }

        Err(TunnelError::Connect {
            port,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no loopback address")),
        })
    }
}

impl Default for LoopbackResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
