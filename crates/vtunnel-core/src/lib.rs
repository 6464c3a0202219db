//! vtunnel-core: shared pieces of the host loopback tunnel.
//!
//! Provides the `CONNECT <port>` control line codec, the error taxonomy,
//! typed transport endpoints (vsock, TCP, Unix) and the guest-side helper
//! that opens a tunnel over an established transport connection.

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used items at crate root.
pub use client::{dial, open_tunnel};
pub use error::{ProtocolError, TunnelError, TunnelResult};
pub use protocol::{read_line, ConnectRequest, Response, MAX_LINE};
pub use transport::{connect, BoxedStream, Endpoint, TunnelStream, DEFAULT_PORT};
