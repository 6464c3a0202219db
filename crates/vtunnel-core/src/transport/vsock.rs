//! Async `AF_VSOCK` sockets on top of `socket2` and [`AsyncFd`].
//!
//! tokio has no native vsock types, so the raw socket is created with
//! `socket2`, switched to non-blocking mode and registered with the reactor.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connected vsock stream.
#[derive(Debug)]
pub struct VsockStream {
    inner: AsyncFd<Socket>,
}

impl VsockStream {
    /// Connect to `cid:port`.
    ///
    /// The connect itself is blocking; vsock connects complete or fail
    /// without network round trips, so it runs on the blocking pool.
    pub async fn connect(cid: u32, port: u32) -> io::Result<Self> {
        let socket = tokio::task::spawn_blocking(move || -> io::Result<Socket> {
            let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
            socket.connect(&SockAddr::vsock(cid, port))?;
            Ok(socket)
        })
        .await
        .map_err(io::Error::other)??;

        Self::from_socket(socket)
    }

    fn from_socket(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: register(socket)?,
        })
    }

    /// `(cid, port)` of the remote end.
    pub fn peer_addr(&self) -> io::Result<(u32, u32)> {
        vsock_pair(&self.inner.get_ref().peer_addr()?)
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}

/// A listening vsock socket.
#[derive(Debug)]
pub struct VsockListener {
    inner: AsyncFd<Socket>,
}

impl VsockListener {
    /// Bind `cid:port` with address reuse and listen with `backlog`.
    pub fn bind(cid: u32, port: u32, backlog: i32) -> io::Result<Self> {
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::vsock(cid, port))?;
        socket.listen(backlog)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: register(socket)?,
        })
    }

    /// Wait for the next connection; returns it with the peer's `(cid, port)`.
    pub async fn accept(&self) -> io::Result<(VsockStream, (u32, u32))> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((socket, addr))) => {
                    let peer = vsock_pair(&addr).unwrap_or((0, 0));
                    return Ok((VsockStream::from_socket(socket)?, peer));
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    /// `(cid, port)` actually bound.
    pub fn local_addr(&self) -> io::Result<(u32, u32)> {
        vsock_pair(&self.inner.get_ref().local_addr()?)
    }
}

/// Hand a non-blocking socket to the reactor. The socket is closed if
/// registration fails.
fn register(socket: Socket) -> io::Result<AsyncFd<Socket>> {
    AsyncFd::try_new(socket).map_err(|e| e.into_parts().1)
}

fn vsock_pair(addr: &SockAddr) -> io::Result<(u32, u32)> {
    addr.as_vsock_address().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "not a vsock address")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VMADDR_CID_ANY;

    const VMADDR_PORT_ANY: u32 = u32::MAX;

    #[tokio::test]
    async fn listener_registers_and_reports_address() {
        // Kernels without the vsock module cannot create the socket at all.
        let listener = match VsockListener::bind(VMADDR_CID_ANY, VMADDR_PORT_ANY, 4) {
            Ok(listener) => listener,
            Err(_) => return,
        };
        let (_, port) = listener.local_addr().unwrap();
        assert_ne!(port, VMADDR_PORT_ANY);
    }
}
