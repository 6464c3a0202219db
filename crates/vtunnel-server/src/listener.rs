//! Listening sockets for every supported transport.
//!
//! TCP and Unix listeners are created through `socket2` so address reuse and
//! the backlog can be set explicitly before handing them to tokio; vsock
//! listeners come from [`vtunnel_core::transport::vsock`]. Accepted
//! connections are returned type-erased so the rest of the server does not
//! care which transport is in use.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::debug;
use vtunnel_core::{BoxedStream, Endpoint, TunnelError, TunnelResult};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(target_os = "linux")]
use vtunnel_core::transport::vsock::VsockListener;

/// A bound listening socket.
#[derive(Debug)]
pub enum TunnelListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    #[cfg(target_os = "linux")]
    Vsock(VsockListener),
}

impl TunnelListener {
    /// Bind and listen on `endpoint`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Bind`] if the socket cannot be created, bound or put
    /// into listening state.
    pub fn bind(endpoint: &Endpoint, backlog: i32) -> TunnelResult<Self> {
        let bind_err = |source: io::Error| TunnelError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Tcp(addr) => bind_tcp(*addr, backlog).map(TunnelListener::Tcp).map_err(bind_err),
            #[cfg(unix)]
            Endpoint::Unix(path) => bind_unix(path, backlog)
                .map(|listener| TunnelListener::Unix {
                    listener,
                    path: path.clone(),
                })
                .map_err(bind_err),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(bind_err(unsupported(endpoint))),
            #[cfg(target_os = "linux")]
            Endpoint::Vsock { cid, port } => VsockListener::bind(*cid, *port, backlog)
                .map(TunnelListener::Vsock)
                .map_err(bind_err),
            #[cfg(not(target_os = "linux"))]
            Endpoint::Vsock { .. } => Err(bind_err(unsupported(endpoint))),
        }
    }

    /// The endpoint actually bound (resolves port 0 for TCP).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            TunnelListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            TunnelListener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            #[cfg(target_os = "linux")]
            TunnelListener::Vsock(listener) => {
                let (cid, port) = listener.local_addr()?;
                Ok(Endpoint::Vsock { cid, port })
            }
        }
    }

    /// Wait for the next connection. Returns the stream and a printable peer
    /// address.
    pub async fn accept(&self) -> TunnelResult<(BoxedStream, String)> {
        match self {
            TunnelListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.map_err(TunnelError::Accept)?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
                }
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            TunnelListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await.map_err(TunnelError::Accept)?;
                Ok((Box::new(stream), format!("unix:{}", path.display())))
            }
            #[cfg(target_os = "linux")]
            TunnelListener::Vsock(listener) => {
                let (stream, (cid, port)) =
                    listener.accept().await.map_err(TunnelError::Accept)?;
                Ok((Box::new(stream), format!("vsock:{cid}:{port}")))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for TunnelListener {
    fn drop(&mut self) {
        if let TunnelListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_tcp(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path, backlog: i32) -> io::Result<UnixListener> {
    use std::os::unix::fs::FileTypeExt;

    // A socket left behind by an earlier run would make bind fail. Anything
    // else at the path is left alone and bind reports the conflict.
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "removed stale socket file");
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog)?;
    UnixListener::from_std(socket.into())
}

#[cfg(any(not(unix), not(target_os = "linux")))]
fn unsupported(endpoint: &Endpoint) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{endpoint} is not supported on this platform"),
    )
}
