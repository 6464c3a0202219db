//! Transport endpoints for the tunnel.
//!
//! The production transport is a hypervisor socket (`AF_VSOCK`). The
//! protocol and relay are transport-independent, so TCP and Unix-domain
//! endpoints are supported as well, mostly for tests and for running the
//! relay outside a VM.
//!
//! Endpoints are written as URIs:
//!
//! | Form                   | Meaning                                  |
//! |------------------------|------------------------------------------|
//! | `vsock://any:5001`     | vsock, any CID (listen side)             |
//! | `vsock://host:5001`    | vsock, CID 2 (guest connecting to host)  |
//! | `vsock://3:5001`       | vsock, explicit CID                      |
//! | `tcp://127.0.0.1:5001` | TCP socket address                       |
//! | `unix:///run/vt.sock`  | Unix-domain socket path                  |
//! | `5001`                 | shorthand for `vsock://any:5001`         |

#[cfg(target_os = "linux")]
pub mod vsock;

use crate::error::{TunnelError, TunnelResult};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Documented default tunnel port.
pub const DEFAULT_PORT: u32 = 5001;

/// Wildcard CID used when listening.
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Well-known CID of the host.
pub const VMADDR_CID_HOST: u32 = 2;

/// Any bidirectional byte stream a tunnel can run over.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Type-erased transport stream, as yielded by listeners and [`connect`].
pub type BoxedStream = Box<dyn TunnelStream>;

/// A typed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    /// The default listening endpoint: vsock port 5001 on any CID.
    pub fn default_listen() -> Self {
        Endpoint::Vsock {
            cid: VMADDR_CID_ANY,
            port: DEFAULT_PORT,
        }
    }

    /// The default guest-side endpoint: vsock port 5001 on the host.
    pub fn default_host() -> Self {
        Endpoint::Vsock {
            cid: VMADDR_CID_HOST,
            port: DEFAULT_PORT,
        }
    }
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TunnelError::InvalidEndpoint(s.to_string());

        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let port = s.parse().map_err(|_| invalid())?;
            return Ok(Endpoint::Vsock {
                cid: VMADDR_CID_ANY,
                port,
            });
        }

        if let Some(rest) = s.strip_prefix("vsock://") {
            let (cid, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
            let cid = match cid {
                "any" => VMADDR_CID_ANY,
                "host" => VMADDR_CID_HOST,
                n => n.parse().map_err(|_| invalid())?,
            };
            let port = port.parse().map_err(|_| invalid())?;
            return Ok(Endpoint::Vsock { cid, port });
        }

        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = rest.parse().map_err(|_| invalid())?;
            return Ok(Endpoint::Tcp(addr));
        }

        if let Some(rest) = s.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Unix(PathBuf::from(rest)));
        }

        Err(invalid())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Vsock { cid, port } if *cid == VMADDR_CID_ANY => {
                write!(f, "vsock://any:{port}")
            }
            Endpoint::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Open a transport connection to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> TunnelResult<BoxedStream> {
    debug!(endpoint = %endpoint, "connecting transport");
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(unsupported(endpoint).into()),
        #[cfg(target_os = "linux")]
        Endpoint::Vsock { cid, port } => {
            let stream = vsock::VsockStream::connect(*cid, *port).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(target_os = "linux"))]
        Endpoint::Vsock { .. } => Err(unsupported(endpoint).into()),
    }
}

/// Error for an endpoint kind this platform has no socket support for.
#[cfg(any(not(unix), not(target_os = "linux")))]
pub(crate) fn unsupported(endpoint: &Endpoint) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{endpoint} is not supported on this platform"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parse_endpoints() {
        assert_eq!(
            "5001".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: VMADDR_CID_ANY, port: 5001 }
        );
        assert_eq!(
            "vsock://any:5001".parse::<Endpoint>().unwrap(),
            Endpoint::default_listen()
        );
        assert_eq!(
            "vsock://host:5001".parse::<Endpoint>().unwrap(),
            Endpoint::default_host()
        );
        assert_eq!(
            "vsock://3:7000".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: 3, port: 7000 }
        );
        assert_eq!(
            "tcp://127.0.0.1:5001".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:5001".parse().unwrap())
        );
        assert_eq!(
            "tcp://[::1]:80".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("[::1]:80".parse().unwrap())
        );
        assert_eq!(
            "unix:///tmp/vt.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/vt.sock"))
        );
    }

    #[test]
    fn reject_bad_endpoints() {
        for s in [
            "",
            "vsock://any",
            "vsock://x:1",
            "vsock://any:port",
            "tcp://localhost:80",
            "unix://",
            "http://127.0.0.1:80",
            "99999999999",
        ] {
            assert!(s.parse::<Endpoint>().is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn display_parses_back() {
        for s in [
            "vsock://any:5001",
            "vsock://2:5001",
            "tcp://127.0.0.1:9",
            "unix:///tmp/a.sock",
        ] {
            let endpoint: Endpoint = s.parse().unwrap();
            assert_eq!(endpoint.to_string(), s);
        }
    }

    #[tokio::test]
    async fn connect_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut stream = connect(&endpoint).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        accept.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connect(&Endpoint::Unix(path)).await.unwrap();
        stream.write_all(b"abc").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect(&Endpoint::Tcp(addr)).await.is_err());
    }
}
