//! vtunnel-server: host side of the loopback tunnel.
//!
//! Listens on a hypervisor socket (or TCP / Unix socket) and lets guests
//! reach services bound to the host's loopback interface.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use vtunnel_server::{ConfigOverrides, ServerConfig, TunnelServer};

/// vtunnel-server: host loopback tunnel relay
#[derive(Parser, Debug)]
#[command(name = "vtunnel-server", version, about = "Host loopback tunnel relay")]
struct Cli {
    /// Listening endpoint (vsock://any:5001, tcp://127.0.0.1:5001, unix:///path)
    #[arg(short, long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.vtunnel/server.toml")]
    config: String,

    /// Only allow tunnels to this destination port (repeatable)
    #[arg(long = "allow-port", value_name = "PORT")]
    allow_ports: Vec<u16>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting vtunnel-server");

    let overrides = ConfigOverrides {
        listen: cli.listen,
        allowed_ports: cli.allow_ports,
        max_sessions: cli.max_sessions,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match TunnelServer::new(config).start().await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("received shutdown signal");
    server.stop().await;

    info!("vtunnel-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
