//! HTTP CONNECT upstream client.

use n0_error::e;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::UpstreamError;
use crate::net::{self, AddrFamily};
use crate::parse::{Authority, ResponseHead};

/// Opens a tunnel to `target` through the HTTP proxy at `proxy` via a
/// `CONNECT` request.
///
/// The response header section is read byte by byte up to the `\r\n\r\n`
/// terminator, so nothing past it is consumed from the stream. Any status
/// other than 200 fails the attempt.
pub async fn connect(
    proxy: &Authority,
    target: &Authority,
    preferred: Option<AddrFamily>,
) -> Result<TcpStream, UpstreamError> {
    let mut stream = net::dial(&proxy.host, proxy.port, preferred).await?;

    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;

    let header = read_header_section(&mut stream).await?;
    let (_, head) = ResponseHead::parse(&header)
        .ok()
        .flatten()
        .ok_or_else(|| {
            e!(UpstreamError::MalformedResponse {
                reason: "invalid CONNECT response head".to_string(),
            })
        })?;
    if head.status != 200 {
        return Err(e!(UpstreamError::UpstreamRejected {
            status: head.status,
            reason: head.reason,
        }));
    }
    debug!(%proxy, %target, "http upstream tunnel established");
    Ok(stream)
}

/// Reads one byte at a time until the header terminator, bounded by the
/// header-section limit.
async fn read_header_section(stream: &mut TcpStream) -> Result<Vec<u8>, UpstreamError> {
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|source| e!(UpstreamError::Io { source }))?;
        header.push(byte[0]);
        if header.ends_with(b"\r\n\r\n") {
            return Ok(header);
        }
        if header.len() > crate::HEADER_SECTION_MAX_LENGTH {
            return Err(e!(UpstreamError::MalformedResponse {
                reason: "CONNECT response header section too large".to_string(),
            }));
        }
    }
}
