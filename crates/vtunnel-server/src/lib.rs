//! vtunnel-server: host side of the loopback tunnel.
//!
//! Accepts transport connections (vsock in production), reads one
//! `CONNECT <port>` line from each, connects to that port on the host's
//! loopback interface and relays bytes until either side closes.
//!
//! # Module layout
//!
//! - [`listener`]: binds the transport endpoint and accepts connections.
//! - [`handler`]: per-connection command parsing and handshake.
//! - [`resolver`]: IPv4-then-IPv6 loopback connect.
//! - [`relay`]: the bidirectional byte pump.
//! - [`policy`]: destination port allowlist and session accounting.
//! - [`server`]: lifecycle (`start` / `stop`) and the accept loop.
//! - [`shutdown`]: the shared running flag.
//! - [`config`]: TOML file + CLI overrides.

pub mod config;
pub mod handler;
pub mod listener;
pub mod policy;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod shutdown;

pub use config::{ConfigOverrides, ServerConfig};
pub use handler::{ConnectionHandler, SessionOutcome};
pub use relay::{RelayConfig, RelayEnd, RelayStats};
pub use resolver::LoopbackResolver;
pub use server::{RunningServer, TunnelServer};
pub use shutdown::ShutdownFlag;
