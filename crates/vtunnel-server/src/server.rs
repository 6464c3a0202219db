//! Core server: owns the listener and dispatches sessions.
//!
//! [`TunnelServer::start`] binds the configured endpoint and spawns the
//! accept loop; each accepted connection gets its own task running
//! [`ConnectionHandler::handle`], so no session ever waits on another.
//! [`RunningServer::stop`] flips the shared [`ShutdownFlag`], which ends the
//! accept loop and closes the listening socket. Sessions already relaying
//! are left to finish on their own or at their next poll tick.

use crate::config::ServerConfig;
use crate::handler::ConnectionHandler;
use crate::listener::TunnelListener;
use crate::policy::TunnelPolicy;
use crate::shutdown::ShutdownFlag;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vtunnel_core::{Endpoint, TunnelError, TunnelResult};

/// A configured, not yet started server.
pub struct TunnelServer {
    config: ServerConfig,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind the listening socket and start accepting.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Bind`] when the endpoint cannot be bound; nothing is
    /// left running in that case.
    pub async fn start(self) -> TunnelResult<RunningServer> {
        let listener = TunnelListener::bind(&self.config.listen, self.config.backlog)?;
        let local = listener.local_endpoint()?;

        let shutdown = ShutdownFlag::new();
        let policy = Arc::new(TunnelPolicy::new(
            &self.config.allowed_ports,
            self.config.max_sessions,
        ));
        let handler = Arc::new(ConnectionHandler::new(
            &self.config,
            policy.clone(),
            shutdown.clone(),
        ));

        info!(
            endpoint = %local,
            allowed_ports = ?self.config.allowed_ports,
            max_sessions = self.config.max_sessions,
            "vtunnel-server ready"
        );

        let accept_task = tokio::spawn(accept_loop(listener, handler, shutdown.clone()));

        Ok(RunningServer {
            local,
            shutdown,
            policy,
            accept_task,
        })
    }
}

/// Handle to a started server.
pub struct RunningServer {
    local: Endpoint,
    shutdown: ShutdownFlag,
    policy: Arc<TunnelPolicy>,
    accept_task: JoinHandle<()>,
}

impl RunningServer {
    /// The endpoint actually bound.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// The flag shared with every session.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Number of sessions currently alive.
    pub fn active_sessions(&self) -> usize {
        self.policy.active_sessions()
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Returns once the accept loop has exited. Sessions in the relay phase
    /// close at their next poll tick.
    pub async fn stop(self) {
        info!(active_sessions = self.active_sessions(), "stopping vtunnel-server");
        self.shutdown.trigger();
        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "accept loop panicked");
        }
    }
}

/// Pause after a failed accept so a persistent error (EMFILE) does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

async fn accept_loop(
    listener: TunnelListener,
    handler: Arc<ConnectionHandler>,
    shutdown: ShutdownFlag,
) {
    let mut next_session: u64 = 1;

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!("accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let session = next_session;
                        next_session += 1;
                        debug!(session, peer = %peer, "connection accepted");

                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle(session, stream).await;
                        });
                    }
                    Err(TunnelError::Accept(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        if shutdown.is_shutdown() {
                            break;
                        }
                        warn!(error = %e, "accept failed");
                        if !pause_after_accept_error(&shutdown).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    drop(listener);
    info!("listener closed");
}

/// Wait out [`ACCEPT_RETRY_DELAY`]. Returns `false` if shutdown arrived first.
async fn pause_after_accept_error(shutdown: &ShutdownFlag) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "tcp://127.0.0.1:0".parse().unwrap(),
            poll_interval: Duration::from_millis(50),
            command_timeout: Some(Duration::from_secs(2)),
            ..ServerConfig::default()
        }
    }

    async fn start(config: ServerConfig) -> (RunningServer, SocketAddr) {
        let server = TunnelServer::new(config).start().await.unwrap();
        let Endpoint::Tcp(addr) = server.local_endpoint().clone() else {
            panic!("expected tcp endpoint");
        };
        (server, addr)
    }

    /// Echo service on an ephemeral loopback port.
    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn read_line_raw(stream: &mut TcpStream) -> String {
        vtunnel_core::read_line(stream, 256).await.unwrap()
    }

    async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn scenario_echo_through_tunnel() {
        let echo = spawn_echo().await;
        let (server, addr) = start(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("CONNECT {echo}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(read_line_raw(&mut client).await, "OK");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.stop().await;
    }

    #[tokio::test]
    async fn scenario_out_of_range_port() {
        let (server, addr) = start(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"CONNECT 70000\r\n").await.unwrap();
        assert_eq!(
            read_to_end(&mut client).await,
            b"ERROR Invalid command. Use: CONNECT <port>\r\n"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn scenario_nothing_listening() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (server, addr) = start(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("CONNECT {port}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            read_to_end(&mut client).await,
            format!("ERROR Cannot connect to localhost:{port}\r\n").into_bytes()
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn open_tunnel_client_against_server() {
        let echo = spawn_echo().await;
        let (server, addr) = start(test_config()).await;

        let mut tunnel = vtunnel_core::dial(&Endpoint::Tcp(addr), echo).await.unwrap();
        tunnel.write_all(b"hello tunnel").await.unwrap();
        let mut buf = [0u8; 12];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tunnel");

        server.stop().await;
    }

    #[tokio::test]
    async fn concurrent_sessions_are_independent() {
        let echo = spawn_echo().await;
        let (server, addr) = start(test_config()).await;

        let mut victim = vtunnel_core::dial(&Endpoint::Tcp(addr), echo).await.unwrap();
        victim.write_all(b"x").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            tasks.push(tokio::spawn(async move {
                let tunnel = vtunnel_core::dial(&Endpoint::Tcp(addr), echo).await.unwrap();
                let payload: Vec<u8> = (0..50_000u32).map(|j| (j as u8).wrapping_add(i)).collect();
                let (mut r, mut w) = tokio::io::split(tunnel);
                let expected = payload.clone();
                let reader = async move {
                    let mut got = vec![0u8; expected.len()];
                    r.read_exact(&mut got).await.unwrap();
                    assert_eq!(got, expected);
                };
                let writer = async move {
                    w.write_all(&payload).await.unwrap();
                };
                tokio::join!(reader, writer);
            }));
        }

        // Killing one session mid-flight leaves the others untouched.
        drop(victim);

        for task in tasks {
            task.await.unwrap();
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_listener() {
        let (server, addr) = start(test_config()).await;
        server.stop().await;

        assert!(TcpStream::connect(addr).await.is_err());

        // The address can be bound again right away.
        let config = ServerConfig {
            listen: Endpoint::Tcp(addr),
            ..test_config()
        };
        let again = TunnelServer::new(config).start().await.unwrap();
        again.stop().await;
    }

    #[tokio::test]
    async fn stop_lets_active_sessions_wind_down() {
        let echo = spawn_echo().await;
        let (server, addr) = start(test_config()).await;

        let mut tunnel = vtunnel_core::dial(&Endpoint::Tcp(addr), echo).await.unwrap();
        tunnel.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        tunnel.read_exact(&mut buf).await.unwrap();

        let flag = server.shutdown_flag();
        server.stop().await;
        assert!(flag.is_shutdown());

        // The relay notices at its next poll tick and closes the tunnel.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), tunnel.read_to_end(&mut rest))
            .await
            .expect("session should close after shutdown")
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            listen: Endpoint::Tcp(taken.local_addr().unwrap()),
            ..test_config()
        };
        assert!(matches!(
            TunnelServer::new(config).start().await,
            Err(TunnelError::Bind { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_transport() {
        let echo = spawn_echo().await;
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("vt.sock"));
        let config = ServerConfig {
            listen: endpoint.clone(),
            ..test_config()
        };
        let server = TunnelServer::new(config).start().await.unwrap();

        let mut tunnel = vtunnel_core::dial(&endpoint, echo).await.unwrap();
        tunnel.write_all(b"over unix").await.unwrap();
        let mut buf = [0u8; 9];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over unix");

        server.stop().await;
    }

    #[tokio::test]
    async fn accept_error_pauses_before_retry() {
        let flag = ShutdownFlag::new();
        let started = std::time::Instant::now();
        assert!(pause_after_accept_error(&flag).await);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn accept_error_pause_ends_on_shutdown() {
        let flag = ShutdownFlag::new();
        flag.trigger();
        let paused = tokio::time::timeout(ACCEPT_RETRY_DELAY / 2, pause_after_accept_error(&flag))
            .await
            .expect("shutdown should cut the pause short");
        assert!(!paused);
    }

    #[tokio::test]
    async fn session_count_tracks_live_sessions() {
        let echo = spawn_echo().await;
        let (server, addr) = start(test_config()).await;

        let tunnel = vtunnel_core::dial(&Endpoint::Tcp(addr), echo).await.unwrap();
        assert_eq!(server.active_sessions(), 1);

        drop(tunnel);
        let mut waited = 0;
        while server.active_sessions() != 0 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(server.active_sessions(), 0);

        server.stop().await;
    }
}
