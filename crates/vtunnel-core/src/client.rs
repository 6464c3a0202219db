//! Guest-side tunnel opening.

use crate::error::{TunnelError, TunnelResult};
use crate::protocol::{read_line, ConnectRequest, Response, MAX_LINE};
use crate::transport::{connect, BoxedStream, Endpoint};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Send `CONNECT <port>` over an established transport stream and wait for
/// the server's answer.
///
/// On `OK` the same stream is handed back, now a raw pipe to the host's
/// loopback service. An `ERROR` answer becomes [`TunnelError::Rejected`]
/// carrying the server's message.
pub async fn open_tunnel<S>(mut stream: S, port: u16) -> TunnelResult<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = ConnectRequest::new(port)?;
    stream.write_all(request.encode().as_bytes()).await?;
    stream.flush().await?;

    let line = read_line(&mut stream, MAX_LINE).await?;
    match Response::parse(&line)? {
        Response::Ok => {
            debug!(port, "tunnel open");
            Ok(stream)
        }
        Response::Error(message) => Err(TunnelError::Rejected(message)),
    }
}

/// Connect to `endpoint` and open a tunnel to host port `port`.
pub async fn dial(endpoint: &Endpoint, port: u16) -> TunnelResult<BoxedStream> {
    let stream = connect(endpoint).await?;
    open_tunnel(stream, port).await
}
