//! vtunnel: guest-side client for the host loopback tunnel.
//!
//! Opens tunnels through `vtunnel-server` to services listening on the
//! host's loopback interface, either bridged to stdio or exposed as a local
//! TCP port inside the guest.

mod commands;

use clap::{Parser, Subcommand};
use tracing::error;
use vtunnel_core::Endpoint;

/// vtunnel: reach host loopback services from a guest
#[derive(Parser)]
#[command(name = "vtunnel", version, about = "Reach host loopback services from a guest")]
struct Cli {
    /// Tunnel server endpoint
    #[arg(short, long, global = true, env = "VTUNNEL_SERVER", default_value_t = Endpoint::default_host())]
    server: Endpoint,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a tunnel and bridge it with stdin/stdout
    Connect {
        /// Destination port on the host's loopback interface
        port: u16,
    },

    /// Expose a host loopback port as a local TCP port
    Forward {
        /// Local address to accept connections on
        #[arg(short, long, default_value = "127.0.0.1:0")]
        listen: String,
        /// Destination port on the host's loopback interface
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so `connect` keeps stdout clean.
    use tracing_subscriber::EnvFilter;
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Connect { port } => commands::connect::run(&cli.server, port).await,
        Command::Forward { listen, port } => {
            commands::forward::run(&cli.server, &listen, port).await
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}
